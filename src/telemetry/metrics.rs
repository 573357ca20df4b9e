//! Metric instrument factories for importq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"importq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for importq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("importq")
}

/// Counter: queue store operations.
/// Labels: `queue`, `operation` ("upsert" | "claim" | "delete" | "quarantine" | ...).
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("importq.queue.operations")
        .with_description("Number of queue store operations")
        .build()
}

/// Counter: claims lost to a concurrent claimer.
/// Labels: `queue`.
pub fn claim_contention() -> Counter<u64> {
    meter()
        .u64_counter("importq.queue.claim_contention")
        .with_description("Claims skipped because another worker won the race")
        .build()
}

/// Counter: records staged from input batches.
/// Labels: `workflow`.
pub fn records_staged() -> Counter<u64> {
    meter()
        .u64_counter("importq.stage.records")
        .with_description("Number of aggregated records upserted into the queue")
        .build()
}

/// Counter: input batches routed after staging.
/// Labels: `workflow`, `disposition` ("processed" | "bad").
pub fn batches_routed() -> Counter<u64> {
    meter()
        .u64_counter("importq.stage.batches")
        .with_description("Number of input batches routed to a sink")
        .build()
}

/// Counter: claimed entries that finished processing.
/// Labels: `workflow`, `result` ("completed" | "quarantined").
pub fn entries_processed() -> Counter<u64> {
    meter()
        .u64_counter("importq.entries.processed")
        .with_description("Number of claimed entries processed")
        .build()
}

/// Counter: quarantine reports delivered.
/// Labels: `workflow`.
pub fn quarantine_reports() -> Counter<u64> {
    meter()
        .u64_counter("importq.alerts.reports")
        .with_description("Number of quarantine reports delivered")
        .build()
}

/// Counter: backpressure signals raised by the monitor.
/// Labels: `workflow`, `signal` ("alert" | "reminder" | "recovered").
pub fn backpressure_signals() -> Counter<u64> {
    meter()
        .u64_counter("importq.monitor.signals")
        .with_description("Backpressure alerts, reminders and recoveries")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("importq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
