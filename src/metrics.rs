// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Changes captured by the recorder (and dropped captures)
//! - Export batches: records, bytes, duration, no-op reasons
//! - Import batches: applied records, per-record skips by reason, failures
//! - SQLite busy retries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `changelog_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use changelog_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_change_logged("users", "update");
//! metrics::record_export(42, 8_192, Duration::from_millis(120));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a change appended to the log.
pub fn record_change_logged(table: &str, operation: &str) {
    counter!(
        "changelog_changes_logged_total",
        "table" => table.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a capture dropped by the recorder (missing fields, bad data, DB error).
pub fn record_change_dropped(reason: &str) {
    counter!("changelog_changes_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a completed export.
pub fn record_export(records: usize, bytes: usize, duration: Duration) {
    counter!("changelog_exports_total", "status" => "success").increment(1);
    counter!("changelog_exported_records_total").increment(records as u64);
    histogram!("changelog_export_file_bytes").record(bytes as f64);
    histogram!("changelog_export_duration_seconds").record(duration.as_secs_f64());
}

/// Record an export that wrote nothing (empty log, weak password, cancelled).
pub fn record_export_skipped(reason: &str) {
    counter!("changelog_exports_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record an export that failed with an error.
pub fn record_export_failed(code: &str) {
    counter!("changelog_exports_total", "status" => "failure", "code" => code.to_string()).increment(1);
}

/// Record a completed import.
pub fn record_import(total: usize, applied: usize, duration: Duration) {
    counter!("changelog_imports_total", "status" => "success").increment(1);
    counter!("changelog_import_records_total").increment(total as u64);
    counter!("changelog_imported_records_total").increment(applied as u64);
    histogram!("changelog_import_duration_seconds").record(duration.as_secs_f64());
}

/// Record one record skipped during import.
pub fn record_import_skip(reason: &str) {
    counter!("changelog_import_skipped_records_total", "reason" => reason.to_string()).increment(1);
}

/// Record an import that wrote nothing (weak password, cancelled).
pub fn record_import_skipped(reason: &str) {
    counter!("changelog_imports_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record an import that failed with an error.
pub fn record_import_failed(code: &str) {
    counter!("changelog_imports_total", "status" => "failure", "code" => code.to_string()).increment(1);
}

/// Record log records not yet exported.
pub fn set_pending_changes(count: u64) {
    gauge!("changelog_pending_changes").set(count as f64);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("changelog_store_retries_total", "operation" => operation.to_string()).increment(1);
}
