// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory fixtures.

use index_sync::config::{ClusterConfig, SyncConfig, SyncMode};
use index_sync::store::memory::MemoryStore;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const INDEX: &str = "products";

/// Store holding `docs` in [`INDEX`].
pub async fn store_with(docs: &[(&str, Value)]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (id, doc) in docs {
        store.insert(INDEX, "doc", id, doc.clone()).await;
    }
    store
}

/// Store holding a generated id -> payload map.
pub async fn store_from_map(docs: &BTreeMap<String, Value>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (id, doc) in docs {
        store.insert(INDEX, "doc", id, doc.clone()).await;
    }
    store
}

/// Serve one undecodable hit per key from [`INDEX`], cycling through the
/// shapes a cursor has to skip.
pub async fn add_malformed(store: &MemoryStore, keys: &[String]) {
    for (i, key) in keys.iter().enumerate() {
        let hit = match i % 3 {
            0 => json!({ "status": 404, "error": "not_found" }),
            1 => json!({ "_index": INDEX, "_id": key }),
            _ => json!("garbage"),
        };
        store.insert_raw_hit(INDEX, key, hit).await;
    }
}

/// Id -> `_source` view of a store's index.
pub async fn contents(store: &MemoryStore) -> BTreeMap<String, Value> {
    store
        .docs(INDEX)
        .await
        .into_iter()
        .map(|(id, doc)| (id, Value::Object(doc.source)))
        .collect()
}

/// Config for a run between two in-memory stores.
pub fn memory_config(mode: SyncMode, page_size: usize) -> SyncConfig {
    let mut config = SyncConfig {
        mode,
        source: ClusterConfig::for_testing("memory://source", INDEX),
        target: ClusterConfig::for_testing("memory://target", INDEX),
        ..Default::default()
    };
    config.scan.doc_buffer_count = page_size;
    config.bulk.idle_timeout = "50ms".into();
    config.retry.max_attempts = 1;
    config
}
