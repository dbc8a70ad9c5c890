//! Metric instrument factories for prioq-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording
//! is always safe.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("prioq-rs")
}

/// Counter: queue operations.
/// Labels: `queue`, `operation` ("push" | "pop" | "peek" | "length" |
/// "drain"), `result` ("ok" | "empty" | "lost_race" | "error").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("prioq.queue.operations")
        .with_description("Number of priority queue operations")
        .build()
}

/// Counter: worker loop iterations.
/// Labels: `worker` ("producer" | "consumer"), `outcome`
/// ("continue" | "retry" | "fatal").
pub fn worker_iterations() -> Counter<u64> {
    meter()
        .u64_counter("prioq.worker.iterations")
        .with_description("Number of worker loop iterations")
        .build()
}

/// Histogram: consumer processing time per item, in milliseconds.
/// Labels: `queue`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("prioq.consumer.processing_ms")
        .with_description("Time spent in the item processor")
        .with_unit("ms")
        .build()
}

/// Record one queue operation.
pub fn record_queue_op(queue: &str, operation: &'static str, result: &'static str) {
    queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
            KeyValue::new("result", result),
        ],
    );
}
