//! Fuzz target for bulk response summarizing.
//!
//! Every counted item comes from the `items` array, and throttled items are
//! a subset of the failures.

#![no_main]

use index_sync::store::http::{summarize_bulk_response, throttled};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let summary = summarize_bulk_response(&value);
    let listed = value.get("items").and_then(|v| v.as_array()).map_or(0, |a| a.len());
    assert!(summary.items + summary.failed <= listed);
    assert!(summary.rejected <= summary.failed);
    if let Some(err) = throttled(&summary) {
        assert!(err.is_retryable());
    }
});
