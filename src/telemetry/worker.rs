//! Worker span helpers.

use tracing::Span;

/// Span covering one worker's execution loop, from connect to release.
pub fn start_worker_span(kind: &str, queue: &str) -> Span {
    tracing::info_span!(
        "worker.run",
        "worker.kind" = kind,
        "messaging.destination.name" = queue,
        "worker.iterations" = tracing::field::Empty,
    )
}

/// Record a lifecycle transition as an event on `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "worker_state_transition");
    });
}

/// Fill in the iteration count once the loop has exited.
pub fn record_iterations(span: &Span, iterations: u64) {
    span.record("worker.iterations", iterations);
}
