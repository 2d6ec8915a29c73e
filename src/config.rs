// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a synchronization run.
//!
//! Configuration is passed to [`Migrator::new()`](crate::Migrator::new) and can
//! be constructed programmatically or loaded from TOML.
//!
//! # Quick Start
//!
//! ```rust
//! use index_sync::config::{SyncConfig, ClusterConfig};
//!
//! let config = SyncConfig {
//!     source: ClusterConfig::for_testing("http://source:9200", "products"),
//!     target: ClusterConfig::for_testing("http://target:9200", "products"),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── mode: copy | sync            # full copy or merge-diff
//! ├── source / target: ClusterConfig
//! ├── scan: ScanConfig             # scroll paging
//! ├── bulk: BulkConfig             # batch ceiling, workers, timers
//! ├── transform: TransformConfig   # index/type override, renames
//! ├── retry: RetrySettings         # calling-layer retry policy
//! ├── wait_for_green: bool
//! └── refresh: bool
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! mode = "sync"
//! wait_for_green = true
//!
//! [source]
//! url = "http://old-cluster:9200"
//! indices = "products"
//!
//! [target]
//! url = "http://new-cluster:9200"
//! indices = "products"
//!
//! [scan]
//! doc_buffer_count = 5000
//! scroll_time = "10m"
//!
//! [bulk]
//! bulk_size_mb = 20
//! workers = 4
//! ```

use crate::error::{Result, SyncError};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Which execution shape a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Scan the source and bulk-index every document into the target
    /// (producer/worker shape).
    Copy,
    /// Merge-diff source against target and apply only the differences
    /// (synchronous diff-drive shape).
    #[default]
    Sync,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Copy => write!(f, "copy"),
            SyncMode::Sync => write!(f, "sync"),
        }
    }
}

/// The top-level config object passed to `Migrator::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: SyncMode,

    pub source: ClusterConfig,

    pub target: ClusterConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub bulk: BulkConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Refuse to start unless both clusters report green.
    #[serde(default = "default_false")]
    pub wait_for_green: bool,

    /// Refresh target indices after restoring their settings.
    #[serde(default = "default_true")]
    pub refresh: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            source: ClusterConfig::for_testing("http://localhost:9200", ""),
            target: ClusterConfig::for_testing("http://localhost:9201", ""),
            scan: ScanConfig::default(),
            bulk: BulkConfig::default(),
            transform: TransformConfig::default(),
            retry: RetrySettings::default(),
            wait_for_green: false,
            refresh: true,
        }
    }
}

impl SyncConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SyncError::Config(format!("Invalid TOML: {}", e)))
    }

    /// Load a config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Index (or comma-separated indices) scanned on the target side.
    ///
    /// Falls back to the transform override, then to the source indices.
    pub fn target_indices(&self) -> String {
        if !self.target.indices.is_empty() {
            return self.target.indices.clone();
        }
        if let Some(ref index) = self.transform.target_index {
            return index.clone();
        }
        self.source.indices.clone()
    }

    /// Check the config for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.source.url.is_empty() {
            return Err(SyncError::Config("source.url is required".into()));
        }
        if self.target.url.is_empty() {
            return Err(SyncError::Config("target.url is required".into()));
        }
        if self.source.indices.is_empty() {
            return Err(SyncError::Config("source.indices is required".into()));
        }
        if self.scan.doc_buffer_count == 0 {
            return Err(SyncError::Config("scan.doc_buffer_count must be > 0".into()));
        }
        if self.scan.slices == 0 {
            return Err(SyncError::Config("scan.slices must be > 0".into()));
        }
        if self.bulk.bulk_size_mb == 0 {
            return Err(SyncError::Config("bulk.bulk_size_mb must be > 0".into()));
        }
        if self.bulk.workers == 0 {
            return Err(SyncError::Config("bulk.workers must be > 0".into()));
        }
        self.transform.rename_rules()?;
        if self.mode == SyncMode::Sync && self.transform.regenerate_id {
            return Err(SyncError::Config(
                "transform.regenerate_id cannot be used in sync mode (diff is keyed on ids)".into(),
            ));
        }
        if self.mode == SyncMode::Sync && self.scan.sort_field != "_id" {
            return Err(SyncError::Config(format!(
                "scan.sort_field must be _id in sync mode, got {}",
                self.scan.sort_field
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClusterConfig: one per side
// ═══════════════════════════════════════════════════════════════════════════════

/// Basic-auth credentials, passed through opaquely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthConfig {
    pub user: String,
    pub password: String,
}

/// Connection parameters for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Base URL, e.g. `"http://es-old:9200"`.
    pub url: String,

    /// Index name, pattern, or comma-separated list.
    #[serde(default)]
    pub indices: String,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// HTTP proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Gzip request bodies (bulk and search).
    #[serde(default)]
    pub compress: bool,
}

fn default_request_timeout() -> String {
    "60s".to_string()
}

impl ClusterConfig {
    /// Create a cluster config for testing.
    pub fn for_testing(url: &str, indices: &str) -> Self {
        Self {
            url: url.to_string(),
            indices: indices.to_string(),
            auth: None,
            proxy: None,
            request_timeout: default_request_timeout(),
            compress: false,
        }
    }

    /// Parse the request timeout, falling back to 60 seconds.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScanConfig: scroll cursor settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Scroll (paginated scan) configuration, shared by both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Scroll keep-alive sent to the cluster (e.g. `"5m"`).
    #[serde(default = "default_scroll_time")]
    pub scroll_time: String,

    /// Documents per scroll page.
    #[serde(default = "default_doc_buffer_count")]
    pub doc_buffer_count: usize,

    /// Query DSL object restricting the scanned documents.
    #[serde(default)]
    pub query: Option<serde_json::Value>,

    /// Field both sides are sorted on. The merge-diff compares ids, so this
    /// must order documents by id.
    #[serde(default = "default_sort_field")]
    pub sort_field: String,

    /// Number of parallel scroll slices (copy mode, 5.x+ only).
    #[serde(default = "default_slices")]
    pub slices: usize,

    /// `_source` projection; `None` fetches the whole document.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

fn default_scroll_time() -> String {
    "5m".to_string()
}

fn default_doc_buffer_count() -> usize {
    10_000
}

fn default_sort_field() -> String {
    "_id".to_string()
}

fn default_slices() -> usize {
    1
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scroll_time: default_scroll_time(),
            doc_buffer_count: default_doc_buffer_count(),
            query: None,
            sort_field: default_sort_field(),
            slices: default_slices(),
            fields: None,
        }
    }
}

impl ScanConfig {
    /// Parse the scroll keep-alive, falling back to 5 minutes.
    pub fn scroll_time_duration(&self) -> Duration {
        humantime::parse_duration(&self.scroll_time).unwrap_or(Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BulkConfig: batching and worker timers
// ═══════════════════════════════════════════════════════════════════════════════

/// Bulk-write pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Byte ceiling of one pending batch, in MB.
    #[serde(default = "default_bulk_size_mb")]
    pub bulk_size_mb: usize,

    /// Concurrent bulk workers (copy mode).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the producer→worker channel. Defaults to the page size.
    #[serde(default)]
    pub channel_capacity: Option<usize>,

    /// Flush whatever is buffered after this long without input.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,

    /// Flush and stop a worker after this long without input.
    #[serde(default = "default_fatal_timeout")]
    pub fatal_timeout: String,

    /// Flush a non-empty buffer once it has been accumulating this long,
    /// even if input keeps trickling in.
    #[serde(default = "default_max_batch_age")]
    pub max_batch_age: String,

    /// Cooldown after every flush, to throttle write pressure.
    #[serde(default = "default_sleep_after_each_bulk")]
    pub sleep_after_each_bulk: String,

    /// Optional per-worker throughput cap in documents per second.
    #[serde(default)]
    pub max_docs_per_sec: Option<u32>,
}

fn default_bulk_size_mb() -> usize {
    10
}

fn default_workers() -> usize {
    1
}

fn default_idle_timeout() -> String {
    "5s".to_string()
}

fn default_fatal_timeout() -> String {
    "5m".to_string()
}

fn default_max_batch_age() -> String {
    "30s".to_string()
}

fn default_sleep_after_each_bulk() -> String {
    "0s".to_string()
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            bulk_size_mb: default_bulk_size_mb(),
            workers: default_workers(),
            channel_capacity: None,
            idle_timeout: default_idle_timeout(),
            fatal_timeout: default_fatal_timeout(),
            max_batch_age: default_max_batch_age(),
            sleep_after_each_bulk: default_sleep_after_each_bulk(),
            max_docs_per_sec: None,
        }
    }
}

impl BulkConfig {
    /// Batch ceiling in bytes.
    pub fn max_batch_bytes(&self) -> usize {
        self.bulk_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn fatal_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.fatal_timeout).unwrap_or(Duration::from_secs(300))
    }

    pub fn max_batch_age_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_batch_age).unwrap_or(Duration::from_secs(30))
    }

    pub fn cooldown(&self) -> Duration {
        humantime::parse_duration(&self.sleep_after_each_bulk).unwrap_or(Duration::ZERO)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransformConfig: ingestion-time rewrites
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-document rewrites applied once when a document enters the bulk pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransformConfig {
    /// Write into this index instead of the source document's index.
    #[serde(default)]
    pub target_index: Option<String>,

    /// Write with this type instead of the source document's type.
    #[serde(default)]
    pub override_type: Option<String>,

    /// Field renames as `"old:new,old2:new2"`. `_type:field` copies the
    /// original type name into `field`.
    #[serde(default)]
    pub rename_fields: Option<String>,

    /// Drop incoming ids so the target assigns new ones.
    #[serde(default = "default_false")]
    pub regenerate_id: bool,
}

impl TransformConfig {
    /// Parse `rename_fields` into rules.
    pub fn rename_rules(&self) -> Result<Vec<crate::document::RenameRule>> {
        match self.rename_fields.as_deref() {
            Some(list) => crate::document::RenameRule::parse_list(list),
            None => Ok(Vec::new()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings: calling-layer retry around flush
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry policy for failed bulk flushes.
///
/// Batches that contain deletes are only retried when `retry_deletes` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts per flush (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_false")]
    pub retry_deletes: bool,
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_deletes: false,
        }
    }
}

impl RetrySettings {
    /// Build the backoff schedule.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: 2.0,
            retry_deletes: self.retry_deletes,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
