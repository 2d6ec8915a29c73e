// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store adapter contract.
//!
//! Defines what the engine needs from a cluster: version and health probes,
//! the scroll cursor protocol, bulk submission and index-settings mutation.
//! Implementations differ only in wire detail between store major versions.
//!
//! - [`http::HttpStore`]: talks to a real cluster over HTTP
//! - `memory::MemoryStore`: in-process store for tests (`test-util` feature)
//! - [`select::resolve_adapter`]: probes a cluster's version and picks the
//!   matching [`ApiVersion`]
//!
//! # Example
//!
//! ```rust,no_run
//! use index_sync::config::ClusterConfig;
//! use index_sync::store::select::resolve_adapter;
//! use index_sync::store::ScrollRequest;
//!
//! # async fn example() -> index_sync::Result<()> {
//! let config = ClusterConfig::for_testing("http://localhost:9200", "products");
//! let store = resolve_adapter(&config, "source").await?;
//! let page = store.open_scroll(&ScrollRequest::new("products", 100)).await?;
//! println!("{} hits", page.total_hits);
//! # Ok(())
//! # }
//! ```

pub mod http;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod select;

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// =============================================================================
// Version and health
// =============================================================================

/// Wire dialect spoken by a cluster, selected from its major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    /// Anything before 5.x.
    V0,
    V5,
    V6,
    V7,
}

impl ApiVersion {
    /// Map a reported version number (e.g. `"6.8.23"`) to a dialect.
    pub fn from_version_number(number: &str) -> Self {
        if number.starts_with("7.") {
            ApiVersion::V7
        } else if number.starts_with("6.") {
            ApiVersion::V6
        } else if number.starts_with("5.") {
            ApiVersion::V5
        } else {
            ApiVersion::V0
        }
    }

    /// Whether sliced scrolls are available.
    pub fn supports_slices(&self) -> bool {
        !matches!(self, ApiVersion::V0)
    }

    /// Whether bulk action lines carry `_type`.
    pub fn uses_types(&self) -> bool {
        !matches!(self, ApiVersion::V7)
    }

    /// Key used for the routing value in bulk action lines.
    pub fn routing_key(&self) -> &'static str {
        match self {
            ApiVersion::V7 => "routing",
            _ => "_routing",
        }
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiVersion::V0 => write!(f, "v0"),
            ApiVersion::V5 => write!(f, "v5"),
            ApiVersion::V6 => write!(f, "v6"),
            ApiVersion::V7 => write!(f, "v7"),
        }
    }
}

/// Body of `GET /`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cluster_name: String,
    pub version: VersionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionInfo {
    pub number: String,
}

impl ClusterVersion {
    pub fn api_version(&self) -> ApiVersion {
        ApiVersion::from_version_number(&self.version.number)
    }
}

/// Cluster health color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Red,
    Yellow,
    Green,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Red => write!(f, "red"),
            HealthStatus::Yellow => write!(f, "yellow"),
            HealthStatus::Green => write!(f, "green"),
        }
    }
}

/// Body of `GET /_cluster/health` (only the fields we use).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterHealth {
    #[serde(default)]
    pub cluster_name: String,
    pub status: HealthStatus,
}

impl ClusterHealth {
    /// With `wait_for_green` only green is ready; otherwise any reachable
    /// cluster is.
    pub fn is_ready(&self, wait_for_green: bool) -> bool {
        match self.status {
            HealthStatus::Red => !wait_for_green,
            HealthStatus::Yellow => !wait_for_green,
            HealthStatus::Green => true,
        }
    }
}

// =============================================================================
// Scroll protocol
// =============================================================================

/// Parameters for opening a scroll cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollRequest {
    pub indices: String,
    /// Keep-alive as sent to the cluster, e.g. `"5m"`.
    pub scroll_time: String,
    pub page_size: usize,
    pub query: Option<Value>,
    pub sort_field: String,
    pub slice_id: usize,
    pub slice_max: usize,
    pub fields: Option<Vec<String>>,
}

impl ScrollRequest {
    /// Unsliced, id-sorted scroll with a 5 minute keep-alive.
    pub fn new(indices: impl Into<String>, page_size: usize) -> Self {
        Self {
            indices: indices.into(),
            scroll_time: "5m".to_string(),
            page_size,
            query: None,
            sort_field: "_id".to_string(),
            slice_id: 0,
            slice_max: 1,
            fields: None,
        }
    }

    pub fn with_slice(mut self, slice_id: usize, slice_max: usize) -> Self {
        self.slice_id = slice_id;
        self.slice_max = slice_max;
        self
    }

    /// Search body for the initial scroll request.
    ///
    /// Slices are only emitted when `slices_supported` and more than one
    /// slice is requested.
    pub fn search_body(&self, slices_supported: bool) -> Value {
        let mut sort = Map::new();
        sort.insert(self.sort_field.clone(), json!("asc"));
        let mut body = json!({ "sort": [sort] });
        if let Some(ref query) = self.query {
            body["query"] = query.clone();
        }
        if slices_supported && self.slice_max > 1 {
            body["slice"] = json!({ "id": self.slice_id, "max": self.slice_max });
        }
        if let Some(ref fields) = self.fields {
            body["_source"] = json!(fields);
        }
        body
    }
}

/// One page returned by a scroll call.
#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    /// Continuation token; `None` once the server stops issuing one.
    pub scroll_id: Option<String>,
    pub total_hits: u64,
    /// Raw hits, validated lazily by the cursor.
    pub hits: Vec<Value>,
}

impl ScrollPage {
    /// Decode a search/scroll response body.
    ///
    /// Accepts both numeric `hits.total` and the `{value, relation}` form.
    pub fn from_response(mut body: Value) -> Result<Self> {
        let scroll_id = body
            .get("_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let hits_obj = body
            .get_mut("hits")
            .ok_or_else(|| SyncError::decode("scroll", "response has no hits object"))?;

        let total_hits = match hits_obj.get("total") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::Object(total)) => total.get("value").and_then(Value::as_u64).unwrap_or(0),
            _ => 0,
        };

        let hits = match hits_obj.get_mut("hits").map(Value::take) {
            Some(Value::Array(hits)) => hits,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(SyncError::decode("scroll", "hits.hits is not an array")),
        };

        Ok(Self {
            scroll_id,
            total_hits,
            hits,
        })
    }
}

/// Summary of a bulk response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkResponse {
    /// Items the target acknowledged.
    pub items: usize,
    /// Items the target rejected individually.
    pub failed: usize,
    /// Failed items that answered 429 (write queue full). Counted in `failed`.
    pub rejected: usize,
}

// =============================================================================
// Adapter trait
// =============================================================================

/// Everything the engine needs from one cluster.
///
/// Object-safe so adapters can be resolved at runtime into
/// `Arc<dyn StoreAdapter>`.
pub trait StoreAdapter: Send + Sync + 'static {
    /// Wire dialect this adapter speaks.
    fn api_version(&self) -> ApiVersion;

    /// Human-readable name for logs ("source", "target", a URL...).
    fn name(&self) -> &str;

    fn cluster_version(&self) -> BoxFuture<'_, ClusterVersion>;

    fn cluster_health(&self) -> BoxFuture<'_, ClusterHealth>;

    /// Open a scroll and return its first page.
    fn open_scroll<'a>(&'a self, request: &'a ScrollRequest) -> BoxFuture<'a, ScrollPage>;

    /// Fetch the page after `scroll_id`.
    fn next_scroll<'a>(&'a self, scroll_time: &'a str, scroll_id: &'a str) -> BoxFuture<'a, ScrollPage>;

    /// Release a scroll. Must tolerate an already-expired token.
    fn clear_scroll<'a>(&'a self, scroll_id: &'a str) -> BoxFuture<'a, ()>;

    /// Submit one newline-delimited bulk body.
    fn bulk(&self, body: Vec<u8>) -> BoxFuture<'_, BulkResponse>;

    /// Current settings of an index (`GET /{index}/_settings`).
    fn index_settings<'a>(&'a self, index: &'a str) -> BoxFuture<'a, Value>;

    fn update_index_settings<'a>(&'a self, index: &'a str, settings: Value) -> BoxFuture<'a, ()>;

    fn refresh_index<'a>(&'a self, index: &'a str) -> BoxFuture<'a, ()>;
}
