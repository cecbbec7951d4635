//! Metric instrument factories for claimq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"claimq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for claimq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("claimq")
}

/// Counter: lease operations by outcome.
/// Labels: `operation` ("claim" | "renew" | "abandon" | "complete"),
/// `result` ("ok" | "lost" | "empty" | "already_done" | "error").
pub fn lease_operations() -> Counter<u64> {
    meter()
        .u64_counter("claimq.lease.operations")
        .with_description("Number of lease operations")
        .build()
}

/// Counter: expired leases returned to the pool by the sweep.
/// Labels: `backend`.
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("claimq.lease.reclaimed")
        .with_description("Number of expired leases reclaimed")
        .build()
}

/// Counter: submissions appended to the ledger.
/// Labels: `backend`.
pub fn submissions_recorded() -> Counter<u64> {
    meter()
        .u64_counter("claimq.ledger.submissions")
        .with_description("Number of submissions recorded")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("claimq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
