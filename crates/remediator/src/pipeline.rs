//! Remediation pipeline
//!
//! [`Remediator`] owns the guard state for the lifetime of the process and
//! drives each alert through Router, Guard, Executor and Audit Logger.
//! Every spawned pipeline is tracked so shutdown can wait for in-flight
//! actions and their audit records.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    alert::{AlertEvent, RemediationKey},
    audit::{AuditLogger, Decision, ExecutionRecord},
    executor::{ActionExecutor, ExecutionReport},
    guard::{Admission, ExecutionGuard},
    metrics,
    registry::{ActionRegistry, RemediationAction},
    router::{AlertRouter, RouteDecision},
};

pub struct Remediator {
    router: AlertRouter,
    guard: ExecutionGuard,
    executor: ActionExecutor,
    audit: AuditLogger,
    pipelines: Mutex<JoinSet<ExecutionRecord>>,
}

impl Remediator {
    pub fn new(registry: Arc<ActionRegistry>, audit: AuditLogger) -> Self {
        Self {
            router: AlertRouter::new(registry),
            guard: ExecutionGuard::new(),
            executor: ActionExecutor::new(),
            audit,
            pipelines: Mutex::new(JoinSet::new()),
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        self.router.registry()
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Process one alert to completion and return its audit record.
    pub async fn process(&self, event: AlertEvent) -> ExecutionRecord {
        match self.router.route(&event) {
            RouteDecision::NoAction { reason, action } => {
                let record = ExecutionRecord::new(&event, Decision::SuppressedNoAction)
                    .with_note(reason.to_string());
                let record = match action {
                    Some(action) => record.with_action(&action),
                    None => record,
                };
                self.finish(record).await
            }
            RouteDecision::Dispatch { action, key } => self.guarded(&event, &action, key).await,
        }
    }

    async fn guarded(
        &self,
        event: &AlertEvent,
        action: &RemediationAction,
        key: RemediationKey,
    ) -> ExecutionRecord {
        let record = ExecutionRecord::new(event, Decision::Executed)
            .with_key(&key)
            .with_action(action);

        let permit = match self.guard.try_acquire(&key, action.cooldown) {
            Admission::Admitted(permit) => permit,
            Admission::InFlight => {
                let record = ExecutionRecord {
                    decision: Decision::SuppressedInFlight,
                    ..record
                }
                .with_note("execution already in flight for this key");
                return self.finish(record).await;
            }
            Admission::Cooldown { remaining } => {
                let record = ExecutionRecord {
                    decision: Decision::SuppressedCooldown,
                    ..record
                }
                .with_note(format!(
                    "cooldown active, {:.1}s remaining",
                    remaining.as_secs_f64()
                ));
                return self.finish(record).await;
            }
        };

        let report = match action.render_args(&key) {
            Ok(args) => self.executor.run(action, &args).await,
            Err(e) => {
                warn!(key = %key, "Failed to render arguments: {}", e);
                ExecutionReport::start_failure(format!("argument rendering failed: {}", e))
            }
        };

        // queued while the key is still held: every later record for this
        // key is appended after this one
        let record = self.finish(record.with_report(report)).await;
        permit.release();
        record
    }

    async fn finish(&self, record: ExecutionRecord) -> ExecutionRecord {
        metrics::DECISIONS_TOTAL
            .with_label_values(&[record.decision.as_str()])
            .inc();
        info!(
            key = %record.remediation_key,
            decision = %record.decision,
            outcome = record.outcome.map(|o| o.as_str()).unwrap_or("-"),
            "Remediation decision"
        );

        self.audit.record(record.clone()).await;
        record
    }

    /// Hand every event to its own tracked task. Returns once all tasks are
    /// spawned; pipelines that already finished are reaped first.
    pub fn dispatch(self: &Arc<Self>, events: Vec<AlertEvent>) {
        let mut pipelines = self.pipelines();
        while let Some(joined) = pipelines.try_join_next() {
            if let Err(e) = joined {
                report_join_error(e);
            }
        }

        for event in events {
            let remediator = Arc::clone(self);
            pipelines.spawn(async move { remediator.process(event).await });
        }
    }

    /// Pipelines spawned and not yet reaped.
    pub fn pending(&self) -> usize {
        self.pipelines().len()
    }

    /// Wait up to `grace` for every dispatched pipeline, then abort the rest.
    /// Returns the records of the pipelines that completed.
    pub async fn drain(&self, grace: Duration) -> Vec<ExecutionRecord> {
        let mut pipelines = std::mem::take(&mut *self.pipelines());
        if pipelines.is_empty() {
            return Vec::new();
        }
        info!(pending = pipelines.len(), "Waiting for remediation pipelines");

        let deadline = tokio::time::Instant::now() + grace;
        let mut records = Vec::with_capacity(pipelines.len());
        loop {
            match tokio::time::timeout_at(deadline, pipelines.join_next()).await {
                Ok(Some(Ok(record))) => records.push(record),
                Ok(Some(Err(e))) => report_join_error(e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = pipelines.len(),
                        "Remediation pipelines still running after {:?}, aborting", grace
                    );
                    pipelines.shutdown().await;
                    break;
                }
            }
        }
        records
    }

    fn pipelines(&self) -> MutexGuard<'_, JoinSet<ExecutionRecord>> {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn report_join_error(e: JoinError) {
    if e.is_panic() {
        error!("Remediation pipeline panicked: {}", e);
    } else {
        debug!("Remediation pipeline cancelled: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertStatus;
    use crate::audit::JsonlAuditSink;
    use crate::executor::{Action, ActionOutput, MockAction, Outcome};
    use crate::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::future::join_all;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn event(identifier: &str, status: AlertStatus, instance: &str) -> AlertEvent {
        AlertEvent {
            identifier: identifier.to_string(),
            status,
            labels: HashMap::from([
                ("alertname".to_string(), identifier.to_string()),
                ("instance".to_string(), instance.to_string()),
            ]),
            annotations: HashMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            fingerprint: None,
        }
    }

    fn succeeded() -> ActionOutput {
        ActionOutput {
            exit_code: Some(0),
            output: "freed 2.1G".to_string(),
            duration: Duration::from_millis(5),
            timed_out: false,
        }
    }

    fn remediator(
        actions: Vec<RemediationAction>,
        dir: &tempfile::TempDir,
    ) -> (Arc<Remediator>, AuditLogger) {
        let registry = Arc::new(ActionRegistry::new(actions).unwrap());
        let sink = Arc::new(JsonlAuditSink::new(dir.path().join("alerts.log")));
        let (audit, _writer) = AuditLogger::start(sink, 64);
        (Arc::new(Remediator::new(registry, audit.clone())), audit)
    }

    #[tokio::test(start_paused = true)]
    async fn test_executed_then_suppressed_by_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let mut cleanup = MockAction::new();
        cleanup.expect_describe().return_const("cleanup".to_string());
        cleanup
            .expect_execute()
            .times(1)
            .returning(|_, _| Ok(succeeded()));
        let action = RemediationAction::new("HighDiskUsage", Arc::new(cleanup))
            .with_timeout(Duration::from_secs(30))
            .with_cooldown(Duration::from_secs(120));
        let (remediator, audit) = remediator(vec![action], &dir);

        let first = remediator
            .process(event("HighDiskUsage", AlertStatus::Firing, "app-1"))
            .await;
        assert_eq!(first.decision, Decision::Executed);
        assert_eq!(first.outcome, Some(Outcome::Success));
        assert_eq!(first.remediation_key, "HighDiskUsage/app-1");

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = remediator
            .process(event("HighDiskUsage", AlertStatus::Firing, "app-1"))
            .await;
        assert_eq!(second.decision, Decision::SuppressedCooldown);
        assert_eq!(second.outcome, None);

        audit.flush().await;
        let recent = audit.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].decision, Decision::SuppressedCooldown);
        assert_eq!(recent[1].decision, Decision::Executed);
    }

    #[tokio::test]
    async fn test_resolved_and_unknown_alerts_spawn_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cleanup = MockAction::new();
        cleanup.expect_describe().return_const("cleanup".to_string());
        cleanup.expect_execute().never();
        let (remediator, _audit) = remediator(
            vec![RemediationAction::new("HighDiskUsage", Arc::new(cleanup))],
            &dir,
        );

        let resolved = remediator
            .process(event("HighDiskUsage", AlertStatus::Resolved, "app-1"))
            .await;
        assert_eq!(resolved.decision, Decision::SuppressedNoAction);

        let unknown = remediator
            .process(event("HighCpuUsage", AlertStatus::Firing, "app-1"))
            .await;
        assert_eq!(unknown.decision, Decision::SuppressedNoAction);
        assert_eq!(unknown.action, None);
        assert_eq!(
            unknown.note.as_deref(),
            Some("no action registered for alert")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_and_start_errors_still_start_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let mut flaky = MockAction::new();
        flaky.expect_describe().return_const("restart".to_string());
        flaky.expect_execute().times(1).returning(|_, _| {
            Ok(ActionOutput {
                exit_code: Some(1),
                output: "Error: No such container".to_string(),
                duration: Duration::from_millis(40),
                timed_out: false,
            })
        });
        let mut missing = MockAction::new();
        missing.expect_describe().return_const("missing".to_string());
        missing
            .expect_execute()
            .times(1)
            .returning(|_, _| Err(crate::Error::Execution("no such file".into())));

        let (remediator, _audit) = remediator(
            vec![
                RemediationAction::new("AppDown", Arc::new(flaky))
                    .with_cooldown(Duration::from_secs(60)),
                RemediationAction::new("HighMemoryUsage", Arc::new(missing))
                    .with_cooldown(Duration::from_secs(60)),
            ],
            &dir,
        );

        let failed = remediator
            .process(event("AppDown", AlertStatus::Firing, "app-1"))
            .await;
        assert_eq!(failed.outcome, Some(Outcome::Failure));
        assert_eq!(failed.exit_code, Some(1));

        let not_started = remediator
            .process(event("HighMemoryUsage", AlertStatus::Firing, "app-1"))
            .await;
        assert_eq!(not_started.outcome, Some(Outcome::Failure));
        assert!(not_started.note.unwrap().contains("no such file"));

        for identifier in ["AppDown", "HighMemoryUsage"] {
            let again = remediator
                .process(event(identifier, AlertStatus::Firing, "app-1"))
                .await;
            assert_eq!(again.decision, Decision::SuppressedCooldown);
        }
        assert!(!remediator
            .guard()
            .is_in_flight(&RemediationKey::new("AppDown", "app-1")));
    }

    /// Sleeps for a while and tracks how many copies run at once.
    struct SlowAction {
        running: AtomicUsize,
        max_running: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Action for SlowAction {
        async fn execute(&self, _args: &[String], _timeout: Duration) -> Result<ActionOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(succeeded())
        }

        fn describe(&self) -> String {
            "slow".to_string()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_execute_once() {
        let dir = tempfile::tempdir().unwrap();
        let slow = slow_action();
        let (remediator, _audit) = remediator(
            vec![RemediationAction::new("HighDiskUsage", slow.clone())
                .with_cooldown(Duration::from_secs(60))],
            &dir,
        );

        let events = (0..16)
            .map(|_| event("HighDiskUsage", AlertStatus::Firing, "app-1"))
            .collect();
        remediator.dispatch(events);
        let records = remediator.drain(Duration::from_secs(10)).await;
        assert_eq!(records.len(), 16);
        assert_eq!(remediator.pending(), 0);

        let executed = records
            .iter()
            .filter(|r| r.decision == Decision::Executed)
            .count();
        assert_eq!(executed, 1);
        assert!(records.iter().all(|r| matches!(
            r.decision,
            Decision::Executed | Decision::SuppressedInFlight | Decision::SuppressedCooldown
        )));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_run_independently() {
        let dir = tempfile::tempdir().unwrap();
        let slow = slow_action();
        let (remediator, _audit) = remediator(
            vec![RemediationAction::new("HighDiskUsage", slow.clone())],
            &dir,
        );

        let records = join_all(["app-1", "app-2", "app-3"].iter().map(|instance| {
            remediator.process(event("HighDiskUsage", AlertStatus::Firing, instance))
        }))
        .await;
        assert!(records.iter().all(|r| r.decision == Decision::Executed));
        assert_eq!(slow.max_running.load(Ordering::SeqCst), 3);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_releases_key() {
        use crate::executor::CommandAction;

        let dir = tempfile::tempdir().unwrap();
        let stuck = RemediationAction::new("AppDown", Arc::new(CommandAction::new("/bin/sh")))
            .with_args(vec!["-c".to_string(), "exec sleep 5".to_string()])
            .unwrap()
            .with_timeout(Duration::from_millis(200))
            .with_cooldown(Duration::ZERO);
        let (remediator, _audit) = remediator(vec![stuck], &dir);
        let key = RemediationKey::new("AppDown", "app-1");

        let record = remediator
            .process(event("AppDown", AlertStatus::Firing, "app-1"))
            .await;
        assert_eq!(record.outcome, Some(Outcome::Timeout));
        assert!(!remediator.guard().is_in_flight(&key));

        // the key is free again, only the (zero) cooldown applies
        let admission = remediator.guard().try_acquire(&key, Duration::ZERO);
        assert!(matches!(admission, Admission::Admitted(_)));
    }

    fn slow_action() -> Arc<SlowAction> {
        Arc::new(SlowAction {
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_drain_waits_for_running_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let (remediator, audit) = remediator(
            vec![RemediationAction::new("HighDiskUsage", slow_action())],
            &dir,
        );

        remediator.dispatch(vec![event("HighDiskUsage", AlertStatus::Firing, "app-1")]);
        assert_eq!(remediator.pending(), 1);

        let records = remediator.drain(Duration::from_secs(5)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Some(Outcome::Success));
        assert_eq!(remediator.pending(), 0);

        // the record was queued before the pipeline finished
        audit.flush().await;
        let recent = audit.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, records[0].id);
    }

    #[tokio::test]
    async fn test_drain_aborts_pipelines_past_grace() {
        let dir = tempfile::tempdir().unwrap();
        let (remediator, _audit) = remediator(
            vec![RemediationAction::new("HighDiskUsage", slow_action())],
            &dir,
        );

        remediator.dispatch(vec![event("HighDiskUsage", AlertStatus::Firing, "app-1")]);
        let records = remediator.drain(Duration::from_millis(10)).await;
        assert!(records.is_empty());
        assert_eq!(remediator.pending(), 0);

        // aborting dropped the permit
        assert!(!remediator
            .guard()
            .is_in_flight(&RemediationKey::new("HighDiskUsage", "app-1")));
    }

    #[tokio::test]
    async fn test_panicking_action_is_reaped_and_releases_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = MockAction::new();
        broken.expect_describe().return_const("broken".to_string());
        broken
            .expect_execute()
            .times(1)
            .returning(|_, _| panic!("action crashed"));
        let (remediator, _audit) = remediator(
            vec![RemediationAction::new("AppDown", Arc::new(broken))
                .with_cooldown(Duration::ZERO)],
            &dir,
        );

        remediator.dispatch(vec![event("AppDown", AlertStatus::Firing, "app-1")]);
        let records = remediator.drain(Duration::from_secs(5)).await;
        assert!(records.is_empty());
        assert!(!remediator
            .guard()
            .is_in_flight(&RemediationKey::new("AppDown", "app-1")));

        // finished pipelines are reaped on the next dispatch
        remediator.dispatch(vec![event("HighCpuUsage", AlertStatus::Firing, "app-1")]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        remediator.dispatch(Vec::new());
        assert_eq!(remediator.pending(), 0);
    }

    #[tokio::test]
    async fn test_audit_file_is_ordered_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let (remediator, audit) = remediator(
            vec![RemediationAction::new("HighDiskUsage", slow_action())
                .with_cooldown(Duration::from_secs(60))],
            &dir,
        );

        remediator.dispatch(vec![event("HighDiskUsage", AlertStatus::Firing, "app-1")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        remediator.dispatch(vec![event("HighDiskUsage", AlertStatus::Firing, "app-1")]);
        remediator.drain(Duration::from_secs(5)).await;
        audit.flush().await;

        let contents = tokio::fs::read_to_string(dir.path().join("alerts.log"))
            .await
            .unwrap();
        let lines: Vec<ExecutionRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        let decisions: Vec<_> = lines.iter().map(|r| r.decision).collect();
        assert_eq!(
            decisions,
            vec![Decision::SuppressedInFlight, Decision::Executed]
        );
        assert!(lines[0].timestamp <= lines[1].timestamp);
        // the execution was admitted before the duplicate arrived
        assert!(lines[1].decided_at < lines[0].decided_at);
    }
}
