//! Metric instrument factories for keygate.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an exporter installed these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("keygate")
}

/// Counter: keys handed to the dispatcher.
pub fn dispatch_submitted() -> Counter<u64> {
    meter()
        .u64_counter("keygate.dispatch.submitted")
        .with_description("Number of keys submitted for dispatch")
        .build()
}

/// Counter: finished submissions.
/// Labels: `result` ("processed" | "failed"), `cause` (failure kind or "none").
pub fn dispatch_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("keygate.dispatch.outcomes")
        .with_description("Number of finished submissions by result")
        .build()
}

/// Counter: submissions that found their key already reserved.
pub fn gate_contended() -> Counter<u64> {
    meter()
        .u64_counter("keygate.gate.contended")
        .with_description("Submissions that had to wait for an equal key")
        .build()
}

/// Histogram: time spent waiting in the gate, in milliseconds.
pub fn gate_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("keygate.gate.wait_ms")
        .with_description("Time spent waiting for a key reservation")
        .with_unit("ms")
        .build()
}

/// Histogram: submission duration from spawn to outcome, in milliseconds.
pub fn dispatch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("keygate.dispatch.duration_ms")
        .with_description("Submission duration in milliseconds")
        .with_unit("ms")
        .build()
}
