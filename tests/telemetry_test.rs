//! Integration tests for telemetry initialization, span helpers and
//! metric instruments.

use opentelemetry::KeyValue;
use prioq_rs::telemetry::{TelemetryConfig, init_telemetry, metrics, worker};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so a second
    // init in the same binary returns Err; either outcome is fine here.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "prioq-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn worker_span_records_transitions_and_iterations() {
    let span = worker::start_worker_span("consumer", "task_queue");
    worker::record_state_transition(&span, "idle", "running");
    worker::record_state_transition(&span, "running", "stopping");
    worker::record_iterations(&span, 42);
}

#[test]
fn metrics_record_without_a_provider() {
    metrics::record_queue_op("task_queue", "pop", "lost_race");
    metrics::worker_iterations().add(
        1,
        &[
            KeyValue::new("worker", "producer"),
            KeyValue::new("outcome", "continue"),
        ],
    );
    metrics::processing_duration_ms().record(12.5, &[KeyValue::new("queue", "task_queue")]);
}
