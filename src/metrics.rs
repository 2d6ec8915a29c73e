// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Records through the `metrics` facade:
//! - Documents scanned per side and records skipped
//! - Changes scheduled by the merge-diff engine
//! - Bulk flush throughput and failures
//! - Worker timer events
//!
//! No recorder is installed here; the embedding application picks one.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `index_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use index_sync::metrics;
//! use std::time::Duration;
//!
//! metrics::record_docs_scanned("source", 500);
//! metrics::record_bulk_flush("worker-0", 1_048_576, 500, 0, Duration::from_millis(80));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Scan Metrics
// =============================================================================

/// Record documents read from one side's cursor.
pub fn record_docs_scanned(side: &str, count: usize) {
    counter!("index_sync_docs_scanned_total", "side" => side.to_string()).increment(count as u64);
}

/// Record a malformed record that was skipped.
pub fn record_record_skipped(side: &str) {
    counter!("index_sync_records_skipped_total", "side" => side.to_string()).increment(1);
}

/// Record a scroll page fetch.
pub fn record_page_fetch(side: &str, duration: Duration) {
    histogram!("index_sync_page_fetch_duration_seconds", "side" => side.to_string())
        .record(duration.as_secs_f64());
}

/// Record a target cursor that failed to open and was replaced by an empty one.
pub fn record_cursor_fallback(side: &str) {
    counter!("index_sync_cursor_fallbacks_total", "side" => side.to_string()).increment(1);
}

// =============================================================================
// Diff Metrics
// =============================================================================

/// Record changes scheduled by one diff iteration.
pub fn record_changes(upserts: usize, deletes: usize) {
    if upserts > 0 {
        counter!("index_sync_upserts_total").increment(upserts as u64);
    }
    if deletes > 0 {
        counter!("index_sync_deletes_total").increment(deletes as u64);
    }
}

/// Current size of the carry-over buffers.
pub fn set_pending_buffers(pending_source: usize, pending_target: usize) {
    gauge!("index_sync_pending_docs", "side" => "source").set(pending_source as f64);
    gauge!("index_sync_pending_docs", "side" => "target").set(pending_target as f64);
}

// =============================================================================
// Bulk Metrics
// =============================================================================

/// Record one successful bulk flush.
pub fn record_bulk_flush(pipeline: &str, bytes: usize, items: usize, failed: usize, duration: Duration) {
    let pipeline = pipeline.to_string();

    counter!("index_sync_bulk_requests_total", "pipeline" => pipeline.clone()).increment(1);
    counter!("index_sync_bulk_bytes_total", "pipeline" => pipeline.clone()).increment(bytes as u64);
    counter!("index_sync_bulk_items_total", "pipeline" => pipeline.clone()).increment(items as u64);
    if failed > 0 {
        counter!("index_sync_bulk_item_failures_total", "pipeline" => pipeline.clone())
            .increment(failed as u64);
    }
    histogram!("index_sync_bulk_flush_duration_seconds", "pipeline" => pipeline)
        .record(duration.as_secs_f64());
}

/// Record a bulk request that failed as a whole.
pub fn record_bulk_failure(pipeline: &str, kind: &str) {
    counter!(
        "index_sync_bulk_failures_total",
        "pipeline" => pipeline.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a retried operation.
pub fn record_retry(operation: &str) {
    counter!("index_sync_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Worker Metrics
// =============================================================================

/// Record a worker timer firing (`idle`, `max_age` or `fatal`).
pub fn record_worker_timer(worker: &str, timer: &'static str) {
    counter!(
        "index_sync_worker_timer_fires_total",
        "worker" => worker.to_string(),
        "timer" => timer
    )
    .increment(1);
}

// =============================================================================
// Run Metrics
// =============================================================================

/// Set the run state gauge.
pub fn set_run_state(state: &str) {
    gauge!("index_sync_run_state", "state" => state.to_string()).set(1.0);
}

/// Record a finished run.
pub fn record_run_complete(mode: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("index_sync_runs_total", "mode" => mode.to_string(), "status" => status).increment(1);
    histogram!("index_sync_run_duration_seconds", "mode" => mode.to_string()).record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state and no recorder is installed here,
    // so these only check that recording never panics.

    #[test]
    fn test_record_scan_metrics() {
        record_docs_scanned("source", 100);
        record_docs_scanned("target", 0);
        record_record_skipped("source");
        record_page_fetch("target", Duration::from_millis(12));
        record_cursor_fallback("target");
    }

    #[test]
    fn test_record_diff_metrics() {
        record_changes(10, 2);
        record_changes(0, 0);
        set_pending_buffers(5, 0);
    }

    #[test]
    fn test_record_bulk_metrics() {
        record_bulk_flush("diff", 4096, 20, 0, Duration::from_millis(30));
        record_bulk_flush("worker-1", 4096, 18, 2, Duration::ZERO);
        record_bulk_failure("worker-1", "transport");
        record_retry("bulk");
    }

    #[test]
    fn test_record_worker_and_run_metrics() {
        record_worker_timer("worker-0", "idle");
        record_worker_timer("worker-0", "fatal");
        set_run_state("running");
        record_run_complete("sync", true, Duration::from_secs(3));
        record_run_complete("copy", false, Duration::ZERO);
    }
}
