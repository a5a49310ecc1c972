//! Metric emission for the pipeline.
//!
//! Every function here writes through the `metrics` facade. Without an
//! installed recorder the calls are no-ops, so hosts choose the exporter.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::classifier::ClassifiedError;
use crate::collector::{CollectionMode, ProcessOutcome, ProcessStatus};
use crate::performance::{OperationKind, PerformanceAlert, PerformanceSnapshot, PerformanceStatus};

pub fn record_classification(error: &ClassifiedError) {
    counter!(
        "error_pipeline.classified",
        1,
        "severity" => error.severity.as_str(),
        "category" => error.category.as_str()
    );
}

/// A rule predicate errored or panicked and was treated as a non-match
pub fn record_predicate_failure(rule_id: &str) {
    counter!("error_pipeline.classifier.predicate_failures", 1, "rule" => rule_id.to_string());
}

pub fn record_overhead(kind: OperationKind, elapsed: Duration) {
    histogram!(
        "error_pipeline.overhead_ms",
        elapsed.as_secs_f64() * 1_000.0,
        "operation" => kind.as_str()
    );
}

pub fn record_alert(alert: &PerformanceAlert) {
    let severity = if alert.is_critical() { "critical" } else { "warning" };
    counter!(
        "error_pipeline.performance.alerts",
        1,
        "metric" => alert.metric.as_str(),
        "severity" => severity
    );
}

pub fn record_snapshot(snapshot: &PerformanceSnapshot) {
    let system = &snapshot.metrics.system;
    gauge!("error_pipeline.system.cpu_percent", system.cpu_percent);
    gauge!("error_pipeline.system.memory_percent", system.memory_percent);
    gauge!("error_pipeline.system.event_loop_lag_ms", system.event_loop_lag_ms);
    gauge!("error_pipeline.overhead.total_ms", snapshot.metrics.overhead.total_ms);
    gauge!(
        "error_pipeline.performance.status",
        match snapshot.status {
            PerformanceStatus::Optimal => 0.0,
            PerformanceStatus::Degraded => 1.0,
            PerformanceStatus::Critical => 2.0,
        }
    );
}

pub fn record_process_outcome(outcome: &ProcessOutcome) {
    let status = match outcome.status {
        ProcessStatus::Accepted => "accepted",
        ProcessStatus::Rejected => "rejected",
        ProcessStatus::Failed => "failed",
    };
    counter!(
        "error_pipeline.collector.processed",
        1,
        "status" => status,
        "mode" => outcome.mode.as_str()
    );
    histogram!("error_pipeline.collector.overhead_ms", outcome.overhead.as_secs_f64() * 1_000.0);
}

pub fn record_queue_length(length: usize) {
    gauge!("error_pipeline.collector.queue_length", length as f64);
}

/// Oldest queued entries discarded to respect the queue limit
pub fn record_overflow(removed: usize) {
    counter!("error_pipeline.collector.overflow_dropped", removed as u64);
}

pub fn record_flush(flushed: usize) {
    counter!("error_pipeline.collector.flushed", flushed as u64);
}

pub fn record_mode_change(from: CollectionMode, to: CollectionMode) {
    counter!(
        "error_pipeline.collector.mode_changes",
        1,
        "from" => from.as_str(),
        "to" => to.as_str()
    );
    gauge!("error_pipeline.collector.mode", to as u8 as f64);
}

pub fn record_recovery_attempt(action_type: &'static str, result: &'static str, duration_ms: u64) {
    counter!(
        "error_pipeline.recovery.attempts",
        1,
        "action" => action_type,
        "result" => result
    );
    histogram!("error_pipeline.recovery.duration_ms", duration_ms as f64, "action" => action_type);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierConfig, ErrorClassifier};
    use crate::context::{ErrorContext, Fault};

    #[test]
    fn test_recording_without_recorder_is_a_noop() {
        let error = ErrorClassifier::new(ClassifierConfig::default())
            .classify_error(&Fault::new("connection refused"), &ErrorContext::new());
        record_classification(&error);
        record_predicate_failure("rule");
        record_overhead(OperationKind::Classification, Duration::from_micros(250));
        record_queue_length(3);
        record_overflow(1);
        record_flush(2);
        record_mode_change(CollectionMode::Full, CollectionMode::Reduced);
        record_recovery_attempt("retry", "success", 12);
    }
}
