// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process store adapter.
//!
//! Keeps documents in sorted maps and speaks the same scroll and bulk
//! contract as a real cluster, so the merge-diff engine and the bulk
//! pipeline can run end-to-end without a network. Bulk bodies are parsed
//! and applied, which makes it usable to verify convergence.
//!
//! Differences from a real cluster:
//! - scrolls always sort by `_id`, and `query` is ignored
//! - slices partition a snapshot round-robin by position
//! - index patterns support exact names, comma lists and a trailing `*`

use super::{
    ApiVersion, BoxFuture, BulkResponse, ClusterHealth, ClusterVersion, HealthStatus, ScrollPage,
    ScrollRequest, StoreAdapter, VersionInfo,
};
use crate::document::Payload;
use crate::error::{Result, SyncError};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDoc {
    pub doc_type: String,
    pub routing: Option<String>,
    pub source: Payload,
}

struct ScrollState {
    hits: Vec<Value>,
    position: usize,
    page_size: usize,
}

/// In-memory implementation of [`StoreAdapter`].
///
/// # Example
/// ```rust
/// # async fn example() {
/// use index_sync::store::memory::MemoryStore;
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store.insert("products", "item", "a1", json!({"name": "widget"})).await;
/// assert_eq!(store.count("products").await, 1);
/// # }
/// ```
pub struct MemoryStore {
    name: String,
    version: ApiVersion,
    health: HealthStatus,
    indices: RwLock<BTreeMap<String, BTreeMap<String, StoredDoc>>>,
    settings: RwLock<HashMap<String, Value>>,
    /// Hits served verbatim, keyed by index then sort key.
    raw_hits: RwLock<BTreeMap<String, Vec<(String, Value)>>>,
    scrolls: RwLock<HashMap<String, ScrollState>>,
    next_scroll: AtomicUsize,
    next_auto_id: AtomicUsize,
    /// Fail this many upcoming bulk calls with a 503.
    fail_bulks: AtomicUsize,
    /// Fail every open_scroll call.
    fail_open: AtomicBool,
    bulk_sizes: RwLock<Vec<usize>>,
    scrolls_opened: AtomicUsize,
    scroll_pages: AtomicUsize,
    scrolls_cleared: AtomicUsize,
    refreshed: RwLock<Vec<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store speaking the 6.x dialect.
    pub fn new() -> Self {
        Self::with_version(ApiVersion::V6)
    }

    pub fn with_version(version: ApiVersion) -> Self {
        Self {
            name: "memory".to_string(),
            version,
            health: HealthStatus::Green,
            indices: RwLock::new(BTreeMap::new()),
            settings: RwLock::new(HashMap::new()),
            raw_hits: RwLock::new(BTreeMap::new()),
            scrolls: RwLock::new(HashMap::new()),
            next_scroll: AtomicUsize::new(0),
            next_auto_id: AtomicUsize::new(0),
            fail_bulks: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            bulk_sizes: RwLock::new(Vec::new()),
            scrolls_opened: AtomicUsize::new(0),
            scroll_pages: AtomicUsize::new(0),
            scrolls_cleared: AtomicUsize::new(0),
            refreshed: RwLock::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    // =========================================================================
    // Test setup and inspection
    // =========================================================================

    /// Insert or overwrite one document. `source` must be a JSON object.
    pub async fn insert(&self, index: &str, doc_type: &str, id: &str, source: Value) {
        let source = match source {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.indices
            .write()
            .await
            .entry(index.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredDoc {
                    doc_type: doc_type.to_string(),
                    routing: None,
                    source,
                },
            );
    }

    /// Serve `hit` verbatim from scrolls over `index`, ordered by `sort_key`.
    /// Used to feed malformed or error records to a cursor.
    pub async fn insert_raw_hit(&self, index: &str, sort_key: &str, hit: Value) {
        self.raw_hits
            .write()
            .await
            .entry(index.to_string())
            .or_default()
            .push((sort_key.to_string(), hit));
    }

    /// Snapshot of one index.
    pub async fn docs(&self, index: &str) -> BTreeMap<String, StoredDoc> {
        self.indices.read().await.get(index).cloned().unwrap_or_default()
    }

    pub async fn get(&self, index: &str, id: &str) -> Option<StoredDoc> {
        self.indices.read().await.get(index).and_then(|docs| docs.get(id).cloned())
    }

    pub async fn count(&self, index: &str) -> usize {
        self.indices.read().await.get(index).map(BTreeMap::len).unwrap_or(0)
    }

    /// Fail the next `n` bulk calls with a retryable error.
    pub fn fail_next_bulks(&self, n: usize) {
        self.fail_bulks.store(n, Ordering::SeqCst);
    }

    /// Make every `open_scroll` fail (simulates a missing index).
    pub fn fail_scroll_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Byte size of every bulk body received, in order.
    pub async fn bulk_sizes(&self) -> Vec<usize> {
        self.bulk_sizes.read().await.clone()
    }

    pub async fn bulk_calls(&self) -> usize {
        self.bulk_sizes.read().await.len()
    }

    pub fn scrolls_opened(&self) -> usize {
        self.scrolls_opened.load(Ordering::SeqCst)
    }

    /// Pages served, counting the first page of each scroll.
    pub fn scroll_pages(&self) -> usize {
        self.scroll_pages.load(Ordering::SeqCst)
    }

    /// Indices passed to `refresh_index`, in call order.
    pub async fn refreshed(&self) -> Vec<String> {
        self.refreshed.read().await.clone()
    }

    pub fn scrolls_cleared(&self) -> usize {
        self.scrolls_cleared.load(Ordering::SeqCst)
    }

    /// Scrolls opened and not yet cleared.
    pub async fn open_scroll_count(&self) -> usize {
        self.scrolls.read().await.len()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn matches(pattern: &str, index: &str) -> bool {
        pattern.split(',').map(str::trim).any(|p| {
            if p == "*" || p == "_all" {
                true
            } else if let Some(prefix) = p.strip_suffix('*') {
                index.starts_with(prefix)
            } else {
                p == index
            }
        })
    }

    fn hit(index: &str, id: &str, doc: &StoredDoc, fields: Option<&Vec<String>>) -> Value {
        let source = match fields {
            Some(fields) => doc
                .source
                .iter()
                .filter(|(k, _)| fields.iter().any(|f| f == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => doc.source.clone(),
        };
        let mut hit = json!({
            "_index": index,
            "_type": doc.doc_type,
            "_id": id,
            "_source": Value::Object(source),
        });
        if let Some(ref routing) = doc.routing {
            hit["_routing"] = json!(routing);
        }
        hit
    }

    async fn serve_page(&self, scroll_id: &str) -> Result<ScrollPage> {
        let mut scrolls = self.scrolls.write().await;
        let state = scrolls.get_mut(scroll_id).ok_or_else(|| {
            SyncError::transport_msg("next_scroll", format!("search_context_missing: {}", scroll_id))
        })?;
        let end = (state.position + state.page_size).min(state.hits.len());
        let hits = state.hits[state.position..end].to_vec();
        state.position = end;
        self.scroll_pages.fetch_add(1, Ordering::SeqCst);
        Ok(ScrollPage {
            scroll_id: Some(scroll_id.to_string()),
            total_hits: state.hits.len() as u64,
            hits,
        })
    }

    async fn apply_bulk(&self, body: &[u8]) -> Result<BulkResponse> {
        let text = std::str::from_utf8(body)
            .map_err(|e| SyncError::decode("bulk", format!("body is not UTF-8: {}", e)))?;
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let mut response = BulkResponse::default();
        let mut indices = self.indices.write().await;

        while let Some(line) = lines.next() {
            let action: Map<String, Value> = serde_json::from_str(line)?;
            let (op, meta) = action
                .into_iter()
                .next()
                .ok_or_else(|| SyncError::decode("bulk", "empty action line"))?;
            let meta_str = |key: &str| meta.get(key).and_then(Value::as_str).map(str::to_string);
            let index = meta_str("_index").ok_or_else(|| SyncError::decode("bulk", "action without _index"))?;

            match op.as_str() {
                "index" | "create" => {
                    let payload_line = lines
                        .next()
                        .ok_or_else(|| SyncError::decode("bulk", "index action without payload"))?;
                    let source: Payload = serde_json::from_str(payload_line)?;
                    let id = meta_str("_id").unwrap_or_else(|| {
                        format!("auto-{}", self.next_auto_id.fetch_add(1, Ordering::SeqCst))
                    });
                    let doc = StoredDoc {
                        doc_type: meta_str("_type").unwrap_or_else(|| "_doc".to_string()),
                        routing: meta_str(self.version.routing_key()),
                        source,
                    };
                    indices.entry(index).or_default().insert(id, doc);
                    response.items += 1;
                }
                "delete" => {
                    let id = meta_str("_id").ok_or_else(|| SyncError::decode("bulk", "delete without _id"))?;
                    if let Some(docs) = indices.get_mut(&index) {
                        docs.remove(&id);
                    }
                    response.items += 1;
                }
                other => {
                    return Err(SyncError::decode("bulk", format!("unknown action {}", other)));
                }
            }
        }
        Ok(response)
    }
}

impl StoreAdapter for MemoryStore {
    fn api_version(&self) -> ApiVersion {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cluster_version(&self) -> BoxFuture<'_, ClusterVersion> {
        let number = match self.version {
            ApiVersion::V7 => "7.17.0",
            ApiVersion::V6 => "6.8.0",
            ApiVersion::V5 => "5.6.0",
            ApiVersion::V0 => "2.4.6",
        };
        Box::pin(async move {
            Ok(ClusterVersion {
                name: self.name.clone(),
                cluster_name: self.name.clone(),
                version: VersionInfo {
                    number: number.to_string(),
                },
            })
        })
    }

    fn cluster_health(&self) -> BoxFuture<'_, ClusterHealth> {
        Box::pin(async move {
            Ok(ClusterHealth {
                cluster_name: self.name.clone(),
                status: self.health,
            })
        })
    }

    fn open_scroll<'a>(&'a self, request: &'a ScrollRequest) -> BoxFuture<'a, ScrollPage> {
        Box::pin(async move {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(SyncError::transport_msg(
                    "open_scroll",
                    format!("index_not_found_exception: {}", request.indices),
                ));
            }

            let mut hits: Vec<(String, Value)> = Vec::new();
            {
                let indices = self.indices.read().await;
                for (index, docs) in indices.iter() {
                    if !Self::matches(&request.indices, index) {
                        continue;
                    }
                    for (id, doc) in docs {
                        hits.push((id.clone(), Self::hit(index, id, doc, request.fields.as_ref())));
                    }
                }
                let raw_hits = self.raw_hits.read().await;
                for (index, raw) in raw_hits.iter() {
                    if Self::matches(&request.indices, index) {
                        hits.extend(raw.iter().cloned());
                    }
                }
            }
            hits.sort_by(|a, b| a.0.cmp(&b.0));

            let slice_max = if self.version.supports_slices() {
                request.slice_max.max(1)
            } else {
                1
            };
            let hits: Vec<Value> = hits
                .into_iter()
                .enumerate()
                .filter(|(pos, _)| slice_max == 1 || pos % slice_max == request.slice_id)
                .map(|(_, (_, hit))| hit)
                .collect();

            let scroll_id = format!("mem-scroll-{}", self.next_scroll.fetch_add(1, Ordering::SeqCst));
            self.scrolls.write().await.insert(
                scroll_id.clone(),
                ScrollState {
                    hits,
                    position: 0,
                    page_size: request.page_size.max(1),
                },
            );
            self.scrolls_opened.fetch_add(1, Ordering::SeqCst);
            self.serve_page(&scroll_id).await
        })
    }

    fn next_scroll<'a>(&'a self, _scroll_time: &'a str, scroll_id: &'a str) -> BoxFuture<'a, ScrollPage> {
        Box::pin(async move { self.serve_page(scroll_id).await })
    }

    fn clear_scroll<'a>(&'a self, scroll_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.scrolls.write().await.remove(scroll_id).is_some() {
                self.scrolls_cleared.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn bulk(&self, body: Vec<u8>) -> BoxFuture<'_, BulkResponse> {
        Box::pin(async move {
            self.bulk_sizes.write().await.push(body.len());

            let should_fail = self
                .fail_bulks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(SyncError::BulkWrite {
                    status: 503,
                    message: "injected failure".to_string(),
                });
            }

            self.apply_bulk(&body).await
        })
    }

    fn index_settings<'a>(&'a self, index: &'a str) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            let settings = self
                .settings
                .read()
                .await
                .get(index)
                .cloned()
                .unwrap_or_else(|| json!({ "refresh_interval": "1s" }));
            let mut body = Map::new();
            body.insert(index.to_string(), json!({ "settings": { "index": settings } }));
            Ok(Value::Object(body))
        })
    }

    fn update_index_settings<'a>(&'a self, index: &'a str, settings: Value) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut all = self.settings.write().await;
            let entry = all
                .entry(index.to_string())
                .or_insert_with(|| json!({ "refresh_interval": "1s" }));
            if let (Some(current), Some(Value::Object(updates))) =
                (entry.as_object_mut(), settings.get("index"))
            {
                for (key, value) in updates {
                    current.insert(key.clone(), value.clone());
                }
            }
            Ok(())
        })
    }

    fn refresh_index<'a>(&'a self, index: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.refreshed.write().await.push(index.to_string());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        for i in 0..n {
            store
                .insert("idx", "doc", &format!("id{:03}", i), json!({ "n": i }))
                .await;
        }
        store
    }

    #[tokio::test]
    async fn test_scroll_pages_in_id_order() {
        let store = seeded(5).await;
        let page = store.open_scroll(&ScrollRequest::new("idx", 2)).await.unwrap();
        assert_eq!(page.total_hits, 5);
        assert_eq!(page.hits.len(), 2);
        assert_eq!(page.hits[0]["_id"], json!("id000"));

        let scroll_id = page.scroll_id.unwrap();
        let page = store.next_scroll("5m", &scroll_id).await.unwrap();
        assert_eq!(page.hits[0]["_id"], json!("id002"));
        let page = store.next_scroll("5m", &scroll_id).await.unwrap();
        assert_eq!(page.hits.len(), 1);
        let page = store.next_scroll("5m", &scroll_id).await.unwrap();
        assert!(page.hits.is_empty());
    }

    #[tokio::test]
    async fn test_clear_scroll_idempotent() {
        let store = seeded(3).await;
        let page = store.open_scroll(&ScrollRequest::new("idx", 10)).await.unwrap();
        let scroll_id = page.scroll_id.unwrap();

        store.clear_scroll(&scroll_id).await.unwrap();
        store.clear_scroll(&scroll_id).await.unwrap();
        store.clear_scroll("never-existed").await.unwrap();
        assert_eq!(store.scrolls_cleared(), 1);
        assert!(store.next_scroll("5m", &scroll_id).await.is_err());
    }

    #[tokio::test]
    async fn test_slices_partition_snapshot() {
        let store = seeded(10).await;
        let mut total = 0;
        for slice in 0..3 {
            let request = ScrollRequest::new("idx", 100).with_slice(slice, 3);
            total += store.open_scroll(&request).await.unwrap().hits.len();
        }
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn test_index_patterns() {
        let store = MemoryStore::new();
        store.insert("logs-1", "doc", "a", json!({})).await;
        store.insert("logs-2", "doc", "b", json!({})).await;
        store.insert("metrics", "doc", "c", json!({})).await;

        for (pattern, expected) in [("logs-*", 2), ("logs-1,metrics", 2), ("*", 3)] {
            let page = store.open_scroll(&ScrollRequest::new(pattern, 100)).await.unwrap();
            assert_eq!(page.total_hits, expected, "pattern {}", pattern);
        }
    }

    #[tokio::test]
    async fn test_bulk_apply_index_and_delete() {
        let store = seeded(2).await;
        let body = concat!(
            "{\"index\":{\"_index\":\"idx\",\"_type\":\"doc\",\"_id\":\"id000\"}}\n",
            "{\"n\":100}\n",
            "{\"delete\":{\"_index\":\"idx\",\"_type\":\"doc\",\"_id\":\"id001\"}}\n",
            "{\"delete\":{\"_index\":\"idx\",\"_type\":\"doc\",\"_id\":\"missing\"}}\n",
            "{\"index\":{\"_index\":\"idx\",\"_type\":\"doc\",\"_routing\":\"r1\"}}\n",
            "{\"n\":7}\n",
        );
        let response = store.bulk(body.as_bytes().to_vec()).await.unwrap();
        assert_eq!(response.items, 4);
        assert_eq!(response.failed, 0);

        let docs = store.docs("idx").await;
        assert_eq!(docs.len(), 2);
        assert_eq!(docs["id000"].source["n"], json!(100));
        assert!(!docs.contains_key("id001"));
        let auto = docs.keys().find(|k| k.starts_with("auto-")).unwrap();
        assert_eq!(docs[auto].routing.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_bulk_injected_failure() {
        let store = MemoryStore::new();
        store.fail_next_bulks(1);
        let body = b"{\"index\":{\"_index\":\"idx\",\"_type\":\"doc\",\"_id\":\"x\"}}\n{}\n".to_vec();

        let err = store.bulk(body.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.bulk(body).await.is_ok());
        assert_eq!(store.bulk_calls().await, 2);
        assert_eq!(store.count("idx").await, 1);
    }

    #[tokio::test]
    async fn test_bulk_malformed() {
        let store = MemoryStore::new();
        assert!(store.bulk(b"not json\n".to_vec()).await.is_err());
        assert!(store
            .bulk(b"{\"index\":{\"_index\":\"idx\",\"_id\":\"x\"}}\n".to_vec())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_index_settings_roundtrip() {
        let store = MemoryStore::new();
        let before = store.index_settings("idx").await.unwrap();
        assert_eq!(before["idx"]["settings"]["index"]["refresh_interval"], json!("1s"));

        store
            .update_index_settings("idx", json!({"index": {"refresh_interval": "-1"}}))
            .await
            .unwrap();
        let after = store.index_settings("idx").await.unwrap();
        assert_eq!(after["idx"]["settings"]["index"]["refresh_interval"], json!("-1"));
    }

    #[tokio::test]
    async fn test_fail_scroll_open() {
        let store = seeded(1).await;
        store.fail_scroll_open(true);
        assert!(store.open_scroll(&ScrollRequest::new("idx", 10)).await.is_err());
    }
}
