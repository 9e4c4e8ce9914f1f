//! Metric instrument factories for batchtrack.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"batchtrack"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for batchtrack instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("batchtrack")
}

/// Counter: work items accepted by the store during bulk writes.
pub fn items_written() -> Counter<u64> {
    meter()
        .u64_counter("batchtrack.store.items_written")
        .with_description("Work items accepted by bulk writes")
        .build()
}

/// Counter: work items the store rejected and that were requeued.
pub fn write_rejections() -> Counter<u64> {
    meter()
        .u64_counter("batchtrack.store.write_rejections")
        .with_description("Work items rejected by bulk writes")
        .build()
}

/// Counter: scan pages fetched.
pub fn scan_pages() -> Counter<u64> {
    meter()
        .u64_counter("batchtrack.store.scan_pages")
        .with_description("Scan pages fetched from the store")
        .build()
}

/// Counter: single-flag updates.
/// Labels: `flag`, `value`.
pub fn flag_updates() -> Counter<u64> {
    meter()
        .u64_counter("batchtrack.store.flag_updates")
        .with_description("Single-flag updates")
        .build()
}

/// Counter: job submissions.
/// Labels: `stage`, `result` ("ok" | "error").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("batchtrack.dispatch.jobs_submitted")
        .with_description("Jobs submitted to the execution service")
        .build()
}

/// Counter: claim state transitions.
/// Labels: `from`, `to`.
pub fn claim_transitions() -> Counter<u64> {
    meter()
        .u64_counter("batchtrack.worker.claim_transitions")
        .with_description("Work item claim state transitions")
        .build()
}

/// Histogram: stage command duration in milliseconds.
/// Labels: `stage`, `result`.
pub fn stage_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchtrack.worker.stage_duration_ms")
        .with_description("Stage command duration in milliseconds")
        .with_unit("ms")
        .build()
}
