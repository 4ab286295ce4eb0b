//! Dispatch span helpers.
//!
//! One span per submission, with gate transitions recorded as events on it.

use std::fmt::Debug;

use tracing::Span;

use crate::model::SubmissionId;

/// Start a span for one submission of `key`.
///
/// The `dispatch.state` field is declared empty and updated by
/// [`record_state_transition`].
pub fn start_dispatch_span<K: Debug>(id: SubmissionId, key: &K) -> Span {
    tracing::info_span!(
        "dispatch.handle",
        "dispatch.id" = %id,
        "dispatch.key" = ?key,
        "dispatch.state" = tracing::field::Empty,
    )
}

/// Record a gate transition (e.g. "waiting" -> "reserved") on the span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("dispatch.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
