//! Fuzz target for the merge diff.
//!
//! Arbitrary snapshots and page sizes must produce exactly the upserts and
//! deletes a set comparison would.

#![no_main]

use index_sync::diff::{diff_sorted, ChangeKind};
use index_sync::SourceRecord;
use libfuzzer_sys::fuzz_target;
use std::collections::{BTreeMap, BTreeSet};

fn records(snapshot: &BTreeMap<String, u8>) -> Vec<SourceRecord> {
    snapshot
        .iter()
        .map(|(id, v)| {
            let mut source = serde_json::Map::new();
            source.insert("v".into(), (*v).into());
            SourceRecord {
                index: "idx".into(),
                doc_type: "doc".into(),
                id: id.clone(),
                routing: None,
                source,
            }
        })
        .collect()
}

fuzz_target!(|data: (u8, Vec<(u8, u8)>, Vec<(u8, u8)>)| {
    let (page_size, source, target) = data;
    let page_size = usize::from(page_size % 16) + 1;
    let source: BTreeMap<String, u8> = source.into_iter().map(|(k, v)| (format!("{:02x}", k), v % 3)).collect();
    let target: BTreeMap<String, u8> = target.into_iter().map(|(k, v)| (format!("{:02x}", k), v % 3)).collect();

    let changes = diff_sorted(&records(&source), &records(&target), page_size).expect("sorted input");

    let upserts: BTreeSet<_> = changes.iter().filter(|c| c.kind == ChangeKind::Upsert).map(|c| c.record.id.clone()).collect();
    let deletes: BTreeSet<_> = changes.iter().filter(|c| c.kind == ChangeKind::Delete).map(|c| c.record.id.clone()).collect();
    let expected_upserts: BTreeSet<_> = source
        .iter()
        .filter(|(id, v)| target.get(*id) != Some(*v))
        .map(|(id, _)| id.clone())
        .collect();
    let expected_deletes: BTreeSet<_> = target.keys().filter(|id| !source.contains_key(*id)).cloned().collect();

    assert_eq!(upserts, expected_upserts);
    assert_eq!(deletes, expected_deletes);
    assert_eq!(changes.len(), upserts.len() + deletes.len());
});
