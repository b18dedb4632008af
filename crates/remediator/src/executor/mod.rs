//! Action Executor
//!
//! Runs one admitted remediation action, bounded by the action's timeout,
//! and classifies what happened. There are no retries here: if the problem
//! persists, Alertmanager will notify again on its next evaluation cycle.

mod command;

pub use command::{CommandAction, DEFAULT_OUTPUT_LIMIT};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{metrics, registry::RemediationAction, Error, Result};

/// Raw result of running an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutput {
    /// `None` when the process was killed (timeout or signal)
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, already truncated by the action
    pub output: String,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Capability to perform one remediation.
///
/// Implementations may shell out, call a container runtime API or run an
/// in-process function. An `Err` means the action could not be started at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, args: &[String], timeout: Duration) -> Result<ActionOutput>;

    /// Short human-readable description used in logs and audit records.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
        }
    }

    /// Timeout wins over whatever exit status the killed process reported.
    pub fn classify(output: &ActionOutput) -> Self {
        if output.timed_out {
            Outcome::Timeout
        } else if output.exit_code == Some(0) {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            "timeout" => Ok(Outcome::Timeout),
            other => Err(Error::Validation(format!("Unknown outcome: {}", other))),
        }
    }
}

/// Classified result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub output: String,
    pub duration: Duration,
    /// Why the action could not be started, if it could not
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn start_failure(error: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            exit_code: None,
            output: String::new(),
            duration: Duration::ZERO,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionExecutor;

impl ActionExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run `action` once with already-rendered arguments.
    pub async fn run(&self, action: &RemediationAction, args: &[String]) -> ExecutionReport {
        info!(
            alert = %action.match_identifier,
            action = %action.describe(),
            timeout_secs = action.timeout.as_secs_f64(),
            "Executing remediation action"
        );

        let in_flight = InFlight::enter();
        let result = action.action().execute(args, action.timeout).await;
        drop(in_flight);

        let report = match result {
            Ok(output) => ExecutionReport {
                outcome: Outcome::classify(&output),
                exit_code: output.exit_code,
                output: output.output,
                duration: output.duration,
                error: None,
            },
            Err(e) => ExecutionReport::start_failure(e.to_string()),
        };

        metrics::EXECUTIONS_TOTAL
            .with_label_values(&[action.match_identifier.as_str(), report.outcome.as_str()])
            .inc();
        metrics::EXECUTION_DURATION_SECONDS
            .with_label_values(&[action.match_identifier.as_str()])
            .observe(report.duration.as_secs_f64());

        match report.outcome {
            Outcome::Success => info!(
                alert = %action.match_identifier,
                duration_ms = report.duration.as_millis() as u64,
                "Remediation action succeeded"
            ),
            Outcome::Failure => error!(
                alert = %action.match_identifier,
                exit_code = ?report.exit_code,
                error = report.error.as_deref().unwrap_or(""),
                "Remediation action failed"
            ),
            Outcome::Timeout => warn!(
                alert = %action.match_identifier,
                timeout_secs = action.timeout.as_secs_f64(),
                "Remediation action timed out and was terminated"
            ),
        }

        report
    }
}

/// Holds the in-flight gauge up until dropped, also when the run is aborted.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::INFLIGHT_EXECUTIONS.inc();
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::INFLIGHT_EXECUTIONS.dec();
    }
}
