// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP store adapter.
//!
//! Talks to a cluster's REST API with `reqwest`. One client per cluster;
//! requests carry basic auth when configured and go through the optional
//! proxy. With `compress` set, bulk and search bodies are sent gzipped;
//! compressed responses are decoded by the client. Wire differences
//! between major versions are confined to the request-building helpers at
//! the bottom of this file so they can be tested without a cluster.

use super::{
    ApiVersion, BoxFuture, BulkResponse, ClusterHealth, ClusterVersion, ScrollPage, ScrollRequest,
    StoreAdapter,
};
use crate::config::{AuthConfig, ClusterConfig};
use crate::error::{Result, SyncError};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::io::Write;
use tracing::{debug, warn};

/// Maximum bytes of an error body kept in error messages.
const ERROR_BODY_LIMIT: usize = 512;

/// [`StoreAdapter`] backed by a cluster's HTTP API.
pub struct HttpStore {
    name: String,
    base_url: String,
    client: Client,
    auth: Option<AuthConfig>,
    version: ApiVersion,
    compress: bool,
}

impl HttpStore {
    /// Build a client for `config`. The dialect defaults to V7 until
    /// [`with_version`](Self::with_version) is called with the probed one.
    pub fn new(name: impl Into<String>, config: &ClusterConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(config.request_timeout_duration());
        if let Some(ref proxy) = config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| SyncError::Config(format!("invalid proxy '{}': {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            auth: config.auth.clone(),
            version: ApiVersion::V7,
            compress: config.compress,
        })
    }

    pub fn with_version(mut self, version: ApiVersion) -> Self {
        self.version = version;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn compresses(&self) -> bool {
        self.compress
    }

    /// Attach `body`, gzipped when compression is on.
    fn with_body(&self, builder: RequestBuilder, content_type: &str, body: Vec<u8>) -> Result<RequestBuilder> {
        let builder = builder.header(CONTENT_TYPE, content_type);
        if !self.compress {
            return Ok(builder.body(body));
        }
        let compressed = gzip(&body)?;
        debug!(store = %self.name, raw = body.len(), compressed = compressed.len(), "Compressed request body");
        Ok(builder.header(CONTENT_ENCODING, "gzip").body(compressed))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match self.auth {
            Some(ref auth) => builder.basic_auth(&auth.user, Some(&auth.password)),
            None => builder,
        }
    }

    /// Send and decode a JSON response, mapping non-2xx to a transport error.
    async fn send_json(&self, operation: &str, builder: RequestBuilder) -> Result<Value> {
        let response = builder
            .send()
            .await
            .map_err(|e| SyncError::transport(operation, e))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::transport(operation, e))?;

        if !status.is_success() {
            return Err(SyncError::transport_msg(
                operation,
                format!("HTTP {}: {}", status.as_u16(), truncate_body(&bytes)),
            ));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::decode(operation, format!("{}: {}", e, truncate_body(&bytes))))
    }

    /// Send a request whose response body we don't need.
    async fn send_empty(&self, operation: &str, builder: RequestBuilder, allow_not_found: bool) -> Result<()> {
        let response = builder
            .send()
            .await
            .map_err(|e| SyncError::transport(operation, e))?;
        let status = response.status();
        if status.is_success() || (allow_not_found && status == StatusCode::NOT_FOUND) {
            return Ok(());
        }
        let bytes = response.bytes().await.unwrap_or_default();
        Err(SyncError::transport_msg(
            operation,
            format!("HTTP {}: {}", status.as_u16(), truncate_body(&bytes)),
        ))
    }
}

impl StoreAdapter for HttpStore {
    fn api_version(&self) -> ApiVersion {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cluster_version(&self) -> BoxFuture<'_, ClusterVersion> {
        Box::pin(async move {
            let body = self.send_json("cluster_version", self.request(Method::GET, "/")).await?;
            serde_json::from_value(body).map_err(|e| SyncError::decode("cluster_version", e.to_string()))
        })
    }

    fn cluster_health(&self) -> BoxFuture<'_, ClusterHealth> {
        Box::pin(async move {
            let body = self
                .send_json("cluster_health", self.request(Method::GET, "/_cluster/health"))
                .await?;
            serde_json::from_value(body).map_err(|e| SyncError::decode("cluster_health", e.to_string()))
        })
    }

    fn open_scroll<'a>(&'a self, request: &'a ScrollRequest) -> BoxFuture<'a, ScrollPage> {
        Box::pin(async move {
            let path = open_scroll_path(request);
            let body = request.search_body(self.version.supports_slices());
            debug!(store = %self.name, path = %path, "Opening scroll");

            let bytes = serde_json::to_vec(&body).map_err(|e| SyncError::decode("open_scroll", e.to_string()))?;
            let builder = self.with_body(self.request(Method::POST, &path), "application/json", bytes)?;
            let response = self.send_json("open_scroll", builder).await?;
            ScrollPage::from_response(response)
        })
    }

    fn next_scroll<'a>(&'a self, scroll_time: &'a str, scroll_id: &'a str) -> BoxFuture<'a, ScrollPage> {
        Box::pin(async move {
            let builder = match next_scroll_body(self.version, scroll_time, scroll_id) {
                ScrollBody::Json(body) => self.request(Method::POST, "/_search/scroll").json(&body),
                ScrollBody::Raw(id) => self
                    .request(Method::POST, &format!("/_search/scroll?scroll={}", scroll_time))
                    .body(id),
            };
            let response = self.send_json("next_scroll", builder).await?;
            ScrollPage::from_response(response)
        })
    }

    fn clear_scroll<'a>(&'a self, scroll_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let builder = match clear_scroll_body(self.version, scroll_id) {
                ScrollBody::Json(body) => self.request(Method::DELETE, "/_search/scroll").json(&body),
                ScrollBody::Raw(id) => self.request(Method::DELETE, "/_search/scroll").body(id),
            };
            // An expired scroll answers 404; that is already the desired state.
            self.send_empty("clear_scroll", builder, true).await
        })
    }

    fn bulk(&self, body: Vec<u8>) -> BoxFuture<'_, BulkResponse> {
        Box::pin(async move {
            let response = self
                .with_body(self.request(Method::POST, "/_bulk"), "application/x-ndjson", body)?
                .send()
                .await
                .map_err(|e| SyncError::transport("bulk", e))?;
            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| SyncError::transport("bulk", e))?;

            if !status.is_success() {
                return Err(SyncError::BulkWrite {
                    status: status.as_u16(),
                    message: truncate_body(&bytes),
                });
            }
            let value: Value = serde_json::from_slice(&bytes)
                .map_err(|e| SyncError::decode("bulk", e.to_string()))?;
            let summary = summarize_bulk_response(&value);
            if let Some(err) = throttled(&summary) {
                warn!(store = %self.name, rejected = summary.rejected, "Bulk request throttled by target");
                return Err(err);
            }
            if summary.failed > 0 {
                warn!(
                    store = %self.name,
                    failed = summary.failed,
                    items = summary.items,
                    first_error = %first_bulk_error(&value).unwrap_or_default(),
                    "Bulk request had item failures"
                );
            }
            Ok(summary)
        })
    }

    fn index_settings<'a>(&'a self, index: &'a str) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            self.send_json(
                "index_settings",
                self.request(Method::GET, &format!("/{}/_settings", index)),
            )
            .await
        })
    }

    fn update_index_settings<'a>(&'a self, index: &'a str, settings: Value) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let builder = self
                .request(Method::PUT, &format!("/{}/_settings", index))
                .json(&settings);
            self.send_empty("update_index_settings", builder, false).await
        })
    }

    fn refresh_index<'a>(&'a self, index: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let builder = self.request(Method::POST, &format!("/{}/_refresh", index));
            self.send_empty("refresh_index", builder, false).await
        })
    }
}

// =============================================================================
// Wire helpers
// =============================================================================

/// Body of a scroll continuation or clear request.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrollBody {
    Json(Value),
    /// Pre-5.x clusters take the bare scroll id as the request body.
    Raw(String),
}

pub fn open_scroll_path(request: &ScrollRequest) -> String {
    format!(
        "/{}/_search?scroll={}&size={}",
        request.indices, request.scroll_time, request.page_size
    )
}

pub fn next_scroll_body(version: ApiVersion, scroll_time: &str, scroll_id: &str) -> ScrollBody {
    match version {
        ApiVersion::V0 => ScrollBody::Raw(scroll_id.to_string()),
        _ => ScrollBody::Json(json!({ "scroll": scroll_time, "scroll_id": scroll_id })),
    }
}

pub fn clear_scroll_body(version: ApiVersion, scroll_id: &str) -> ScrollBody {
    match version {
        ApiVersion::V0 => ScrollBody::Raw(scroll_id.to_string()),
        _ => ScrollBody::Json(json!({ "scroll_id": [scroll_id] })),
    }
}

/// Count acknowledged and rejected items in a bulk response.
///
/// A delete answering 404 is not a failure: the document is already gone.
pub fn summarize_bulk_response(response: &Value) -> BulkResponse {
    let items = match response.get("items").and_then(Value::as_array) {
        Some(items) => items,
        None => return BulkResponse::default(),
    };

    let mut summary = BulkResponse::default();
    for item in items {
        let Some((action, result)) = item.as_object().and_then(|o| o.iter().next()) else {
            continue;
        };
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
        let failed = result.get("error").is_some()
            || (status >= 300 && !(action == "delete" && status == 404));
        if failed {
            summary.failed += 1;
            if status == 429 {
                summary.rejected += 1;
            }
        } else {
            summary.items += 1;
        }
    }
    summary
}

/// A batch whose only failures are 429s is reported as a retryable
/// request failure, so the retry policy re-sends it whole. Mixed failures
/// stay item-level and are counted.
pub fn throttled(summary: &BulkResponse) -> Option<SyncError> {
    if summary.rejected == 0 || summary.rejected != summary.failed {
        return None;
    }
    Some(SyncError::BulkWrite {
        status: 429,
        message: format!(
            "{} of {} items rejected (too many requests)",
            summary.rejected,
            summary.items + summary.failed
        ),
    })
}

/// Gzip a request body.
pub fn gzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body)
        .map_err(|e| SyncError::Internal(format!("gzip failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SyncError::Internal(format!("gzip failed: {}", e)))
}

fn first_bulk_error(response: &Value) -> Option<String> {
    response
        .get("items")?
        .as_array()?
        .iter()
        .filter_map(|item| item.as_object()?.values().next()?.get("error"))
        .map(Value::to_string)
        .next()
}

fn truncate_body(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= ERROR_BODY_LIMIT {
        return text.into_owned();
    }
    let mut end = ERROR_BODY_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_scroll_path() {
        let request = ScrollRequest::new("logs-*", 500);
        assert_eq!(open_scroll_path(&request), "/logs-*/_search?scroll=5m&size=500");
    }

    #[test]
    fn test_next_scroll_body_by_version() {
        assert_eq!(
            next_scroll_body(ApiVersion::V0, "1m", "abc"),
            ScrollBody::Raw("abc".into())
        );
        assert_eq!(
            next_scroll_body(ApiVersion::V6, "1m", "abc"),
            ScrollBody::Json(json!({"scroll": "1m", "scroll_id": "abc"}))
        );
    }

    #[test]
    fn test_clear_scroll_body_by_version() {
        assert_eq!(clear_scroll_body(ApiVersion::V0, "abc"), ScrollBody::Raw("abc".into()));
        assert_eq!(
            clear_scroll_body(ApiVersion::V7, "abc"),
            ScrollBody::Json(json!({"scroll_id": ["abc"]}))
        );
    }

    #[test]
    fn test_summarize_bulk_response() {
        let response = json!({
            "took": 3,
            "errors": true,
            "items": [
                {"index": {"_id": "1", "status": 201}},
                {"index": {"_id": "2", "status": 400, "error": {"type": "mapper_parsing_exception"}}},
                {"delete": {"_id": "3", "status": 404, "result": "not_found"}},
                {"delete": {"_id": "4", "status": 200}},
                {"index": {"_id": "5", "status": 429}}
            ]
        });
        let summary = summarize_bulk_response(&response);
        assert_eq!(summary.items, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.rejected, 1);
        // A mapping error alongside the 429 keeps the failures item-level.
        assert!(throttled(&summary).is_none());
        assert!(first_bulk_error(&response).unwrap().contains("mapper_parsing_exception"));
    }

    #[test]
    fn test_only_throttled_items_fail_the_request() {
        let response = json!({
            "errors": true,
            "items": [
                {"index": {"_id": "1", "status": 201}},
                {"index": {"_id": "2", "status": 429, "error": {"type": "es_rejected_execution_exception"}}},
                {"delete": {"_id": "3", "status": 429, "error": {"type": "es_rejected_execution_exception"}}}
            ]
        });
        let summary = summarize_bulk_response(&response);
        assert_eq!(summary.rejected, 2);
        let err = throttled(&summary).unwrap();
        assert!(matches!(err, SyncError::BulkWrite { status: 429, .. }));
        assert!(err.is_retryable());

        let clean = summarize_bulk_response(&json!({"items": [{"index": {"_id": "1", "status": 200}}]}));
        assert!(throttled(&clean).is_none());
    }

    #[test]
    fn test_summarize_empty_bulk_response() {
        assert_eq!(summarize_bulk_response(&json!({})), BulkResponse::default());
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body(b"short"), "short");
        let long = "x".repeat(ERROR_BODY_LIMIT + 10);
        let truncated = truncate_body(long.as_bytes());
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.len(), ERROR_BODY_LIMIT + 3);
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let config = ClusterConfig::for_testing("http://localhost:9200/", "idx");
        let store = HttpStore::new("source", &config).unwrap();
        assert_eq!(store.base_url(), "http://localhost:9200");
        assert_eq!(store.api_version(), ApiVersion::V7);
        assert_eq!(store.with_version(ApiVersion::V5).api_version(), ApiVersion::V5);
    }

    #[test]
    fn test_gzip_bulk_body() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let body = "{\"index\":{\"_index\":\"idx\",\"_id\":\"1\"}}\n{\"n\":1}\n".repeat(50);
        let compressed = gzip(body.as_bytes()).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert!(compressed.len() < body.len());

        let mut decoded = String::new();
        GzDecoder::new(compressed.as_slice()).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_compressed_request_headers() {
        let mut config = ClusterConfig::for_testing("http://localhost:9200", "idx");
        config.compress = true;
        let store = HttpStore::new("target", &config).unwrap();
        assert!(store.compresses());

        let request = store
            .with_body(store.request(Method::POST, "/_bulk"), "application/x-ndjson", b"{}\n".to_vec())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(request.headers()[CONTENT_TYPE], "application/x-ndjson");
        let sent = request.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(&sent[..2], &[0x1f, 0x8b]);

        let plain = HttpStore::new("target", &ClusterConfig::for_testing("http://localhost:9200", "idx")).unwrap();
        let request = plain
            .with_body(plain.request(Method::POST, "/_bulk"), "application/x-ndjson", b"{}\n".to_vec())
            .unwrap()
            .build()
            .unwrap();
        assert!(request.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(request.body().and_then(|b| b.as_bytes()), Some(&b"{}\n"[..]));
    }

    #[test]
    fn test_new_rejects_bad_proxy() {
        let mut config = ClusterConfig::for_testing("http://localhost:9200", "idx");
        config.proxy = Some("http://[::1".into());
        assert!(matches!(HttpStore::new("source", &config), Err(SyncError::Config(_))));
    }
}
