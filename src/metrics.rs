//! Metrics emitted through the `metrics` facade.
//!
//! Nothing here installs a recorder; without one every call is a no-op. An
//! embedding application can install any `metrics` exporter to collect them.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub const BATCHES_TOTAL: &str = "channel_coords_batches_total";
pub const MESSAGES_INSERTED_TOTAL: &str = "channel_coords_messages_inserted_total";
pub const MESSAGES_SKIPPED_TOTAL: &str = "channel_coords_messages_skipped_total";
pub const COORDINATES_FOUND_TOTAL: &str = "channel_coords_coordinates_found_total";
pub const MALFORMED_RECORDS_TOTAL: &str = "channel_coords_malformed_records_total";
pub const BATCH_DURATION: &str = "channel_coords_batch_duration_seconds";
pub const SOURCE_RETRIES_TOTAL: &str = "channel_coords_source_retries_total";
pub const CHANNEL_FAILURES_TOTAL: &str = "channel_coords_channel_failures_total";
pub const IMPORTS_TOTAL: &str = "channel_coords_imports_total";
pub const IMPORT_DURATION: &str = "channel_coords_import_duration_seconds";
pub const EXPORTED_MESSAGES: &str = "channel_coords_exported_messages";

/// Record one committed ingestion batch
pub fn record_batch(inserted: usize, skipped: usize, coordinates: usize, malformed: usize, duration: Duration) {
    counter!(BATCHES_TOTAL).increment(1);
    counter!(MESSAGES_INSERTED_TOTAL).increment(inserted as u64);
    counter!(MESSAGES_SKIPPED_TOTAL).increment(skipped as u64);
    counter!(COORDINATES_FOUND_TOTAL).increment(coordinates as u64);
    counter!(MALFORMED_RECORDS_TOTAL).increment(malformed as u64);
    histogram!(BATCH_DURATION).record(duration.as_secs_f64());
}

/// Record a retried source call
pub fn record_source_retry(error_kind: &'static str) {
    counter!(SOURCE_RETRIES_TOTAL, "kind" => error_kind).increment(1);
}

/// Record a channel whose ingestion failed
pub fn record_channel_failure(error_kind: &'static str) {
    counter!(CHANNEL_FAILURES_TOTAL, "kind" => error_kind).increment(1);
}

/// Record a finished import attempt
pub fn record_import(strategy: &'static str, status: &'static str, dry_run: bool, duration: Duration) {
    let mode = if dry_run { "dry_run" } else { "apply" };
    counter!(IMPORTS_TOTAL, "strategy" => strategy, "status" => status, "mode" => mode).increment(1);
    histogram!(IMPORT_DURATION).record(duration.as_secs_f64());
}

/// Record the size of the last export
#[allow(clippy::cast_precision_loss)]
pub fn record_export(messages: usize) {
    gauge!(EXPORTED_MESSAGES).set(messages as f64);
}
