use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

use crate::{Error, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref ALERTS_RECEIVED_TOTAL: IntCounter = register_int_counter_with_registry!(
        "remediator_alerts_received_total",
        "Total number of alerts received on the webhook.",
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "remediator_decisions_total",
        "Pipeline decisions by kind.",
        &["decision"],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "remediator_executions_total",
        "Remediation action executions by alert and outcome.",
        &["action", "outcome"],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref EXECUTION_DURATION_SECONDS: HistogramVec = register_histogram_vec_with_registry!(
        "remediator_execution_duration_seconds",
        "Wall clock duration of remediation actions.",
        &["action"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref INFLIGHT_EXECUTIONS: IntGauge = register_int_gauge_with_registry!(
        "remediator_inflight_executions",
        "Remediation actions currently running.",
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref AUDIT_WRITE_FAILURES_TOTAL: IntCounter = register_int_counter_with_registry!(
        "remediator_audit_write_failures_total",
        "Audit records the sink could not persist.",
        REGISTRY
    )
    .expect("metric can be registered");
}

/// Force registration so every series shows up before its first update.
pub fn register_metrics() {
    lazy_static::initialize(&ALERTS_RECEIVED_TOTAL);
    lazy_static::initialize(&DECISIONS_TOTAL);
    lazy_static::initialize(&EXECUTIONS_TOTAL);
    lazy_static::initialize(&EXECUTION_DURATION_SECONDS);
    lazy_static::initialize(&INFLIGHT_EXECUTIONS);
    lazy_static::initialize(&AUDIT_WRITE_FAILURES_TOTAL);
}

/// Text exposition of everything in [`REGISTRY`].
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        register_metrics();
        ALERTS_RECEIVED_TOTAL.inc();
        DECISIONS_TOTAL.with_label_values(&["executed"]).inc();

        let text = gather_metrics().unwrap();
        assert!(text.contains("remediator_alerts_received_total"));
        assert!(text.contains("remediator_decisions_total{decision=\"executed\"}"));
        assert!(text.contains("remediator_inflight_executions"));
    }
}
