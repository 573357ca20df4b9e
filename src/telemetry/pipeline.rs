//! Pipeline span helpers.
//!
//! Provides span creation and phase recording for ticks and the entries
//! processed within them.

use tracing::Span;
use uuid::Uuid;

/// Start a span covering one pipeline tick.
///
/// The `tick.phase` field is declared empty and updated via [`record_phase`].
pub fn start_tick_span(workflow: &str, tick_id: &Uuid) -> Span {
    tracing::info_span!(
        "pipeline.tick",
        "pipeline.workflow" = workflow,
        "tick.id" = %tick_id,
        "tick.phase" = tracing::field::Empty,
    )
}

/// Start a span for processing one claimed entry.
pub fn start_entry_span(queue: &str, id: &str) -> Span {
    tracing::info_span!(
        "pipeline.entry",
        "entry.queue" = queue,
        "entry.id" = id,
        "entry.result" = tracing::field::Empty,
    )
}

/// Record that a tick entered `phase`.
pub fn record_phase(span: &Span, phase: &str) {
    span.record("tick.phase", phase);
    span.in_scope(|| {
        tracing::debug!(phase = phase, "phase_started");
    });
}

/// Record how an entry finished.
pub fn record_entry_result(span: &Span, result: &str) {
    span.record("entry.result", result);
}
