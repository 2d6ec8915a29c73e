//! Fuzz target for scroll response and hit decoding.
//!
//! Arbitrary JSON must decode to a page or an error, never a panic, and
//! every decoded record must carry the fields the diff relies on.

#![no_main]

use index_sync::store::ScrollPage;
use index_sync::SourceRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    if let Ok(record) = SourceRecord::from_hit(value.clone()) {
        let _ = record.id.len();
        let _ = record.index.len();
    }

    if let Ok(page) = ScrollPage::from_response(value) {
        for hit in page.hits {
            let _ = SourceRecord::from_hit(hit);
        }
    }
});
