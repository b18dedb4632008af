//! Audit Logger
//!
//! One [`ExecutionRecord`] per processed alert, appended to a durable sink.
//! All appends are funnelled through a single writer task so concurrent
//! pipelines never interleave writes. A failing sink never fails the
//! pipeline: the record is written to stderr instead and processing goes on.

pub mod config;
mod factory;
mod jsonl;
mod sqlite;

pub use config::{AuditConfig, AuditSinkType};
pub use factory::create_sink;
pub use jsonl::JsonlAuditSink;
pub use sqlite::SqliteAuditSink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    alert::{AlertEvent, AlertStatus, RemediationKey},
    executor::{ExecutionReport, Outcome},
    metrics,
    registry::RemediationAction,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    SuppressedCooldown,
    SuppressedInFlight,
    SuppressedNoAction,
    Executed,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::SuppressedCooldown => "suppressed_cooldown",
            Decision::SuppressedInFlight => "suppressed_in_flight",
            Decision::SuppressedNoAction => "suppressed_no_action",
            Decision::Executed => "executed",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "suppressed_cooldown" => Ok(Decision::SuppressedCooldown),
            "suppressed_in_flight" => Ok(Decision::SuppressedInFlight),
            "suppressed_no_action" => Ok(Decision::SuppressedNoAction),
            "executed" => Ok(Decision::Executed),
            other => Err(Error::Validation(format!("Unknown decision: {}", other))),
        }
    }
}

/// Audit entry for one processed alert. Never mutated once written.
///
/// `timestamp` is when the record was finalized: completion of the action
/// for `executed`, the decision itself for suppressions. Records for one key
/// reach the sink in finalization order, so their timestamps never go back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// When the router and guard made the decision
    pub decided_at: DateTime<Utc>,
    pub alert: String,
    pub resource: Option<String>,
    pub remediation_key: String,
    pub alert_status: AlertStatus,
    /// Description of the matched action
    pub action: Option<String>,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ExecutionRecord {
    pub fn new(event: &AlertEvent, decision: Decision) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            timestamp: now,
            decided_at: now,
            alert: event.identifier.clone(),
            resource: None,
            remediation_key: event.identifier.clone(),
            alert_status: event.status,
            action: None,
            decision,
            outcome: None,
            exit_code: None,
            duration_ms: None,
            output: None,
            note: None,
        }
    }

    pub fn with_key(mut self, key: &RemediationKey) -> Self {
        self.resource = Some(key.resource.clone());
        self.remediation_key = key.to_string();
        self
    }

    pub fn with_action(mut self, action: &RemediationAction) -> Self {
        self.action = Some(action.describe());
        self
    }

    /// Attach the execution result and stamp the completion time.
    pub fn with_report(mut self, report: ExecutionReport) -> Self {
        self.timestamp = Utc::now();
        self.outcome = Some(report.outcome);
        self.exit_code = report.exit_code;
        self.duration_ms = Some(report.duration.as_millis() as u64);
        self.output = Some(report.output).filter(|output| !output.is_empty());
        if let Some(error) = report.error {
            self.note = Some(error);
        }
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Durable destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Prepare the sink (create directories, run migrations).
    async fn init(&self) -> Result<()>;

    async fn append(&self, record: &ExecutionRecord) -> Result<()>;

    /// Most recent records, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>>;

    fn describe(&self) -> String;
}

enum AuditCommand {
    Append(ExecutionRecord),
    Flush(oneshot::Sender<()>),
}

/// Handle to the audit writer task. Cheap to clone.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<AuditCommand>,
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    /// Spawn the writer task. It stops once every handle has been dropped
    /// and the queue is drained.
    pub fn start(sink: Arc<dyn AuditSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        info!("Starting audit writer for {}", sink.describe());
        let writer = tokio::spawn(write_loop(Arc::clone(&sink), rx));
        (Self { tx, sink }, writer)
    }

    /// Queue a record. Waits for queue space rather than dropping records.
    pub async fn record(&self, record: ExecutionRecord) {
        if let Err(mpsc::error::SendError(command)) =
            self.tx.send(AuditCommand::Append(record)).await
        {
            if let AuditCommand::Append(record) = command {
                fallback(&record, &Error::Audit("audit writer is not running".into()));
            }
        }
    }

    /// Wait until everything queued before this call has been handed to the sink.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.sink.recent(limit).await
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }
}

async fn write_loop(sink: Arc<dyn AuditSink>, mut rx: mpsc::Receiver<AuditCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            AuditCommand::Append(record) => {
                if let Err(e) = sink.append(&record).await {
                    fallback(&record, &e);
                } else {
                    debug!(key = %record.remediation_key, decision = %record.decision, "Audit record written");
                }
            }
            AuditCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    info!("Audit writer stopped");
}

/// Secondary channel for records the sink could not take.
fn fallback(record: &ExecutionRecord, err: &Error) {
    metrics::AUDIT_WRITE_FAILURES_TOTAL.inc();
    error!(
        key = %record.remediation_key,
        decision = %record.decision,
        "Failed to write audit record: {}",
        err
    );
    match serde_json::to_string(record) {
        Ok(line) => eprintln!("{}", line),
        Err(e) => eprintln!("{:?} (unserializable: {})", record, e),
    }
}
