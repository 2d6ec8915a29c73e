// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk-write pipeline.
//!
//! Accumulates classified document operations into a size-bounded batch,
//! encodes them in the bulk wire format and ships them to the target.
//!
//! # Design
//!
//! ```text
//! BulkOp ──▶ BulkBatch::push ──▶ [action line][payload line]... ──▶ flush ──▶ StoreAdapter::bulk
//!              (pure, no I/O)        bounded by max_bytes           │
//!                                                                   ▼
//!                                                               cooldown
//! ```
//!
//! [`BulkBatch`] is pure buffering. [`BulkPipeline`] owns a batch and a
//! target: `submit` flushes the current batch first whenever appending the
//! next operation would cross the byte ceiling, so a pending batch never
//! exceeds it (an operation larger than the ceiling on its own is sent
//! alone).
//!
//! `flush` never retries. `flush_retrying` is the calling-layer wrapper
//! that applies a [`RetryConfig`].

use crate::config::BulkConfig;
use crate::document::DocumentEnvelope;
use crate::error::Result;
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::store::{ApiVersion, StoreAdapter};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// One classified operation for the target.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    /// Insert or overwrite a document.
    Upsert(DocumentEnvelope),
    /// Remove a document by id.
    Delete {
        index: String,
        doc_type: String,
        id: String,
        routing: Option<String>,
    },
}

impl BulkOp {
    pub fn is_delete(&self) -> bool {
        matches!(self, BulkOp::Delete { .. })
    }

    /// Append this operation's line(s) to `out`.
    pub fn encode_into(&self, version: ApiVersion, out: &mut Vec<u8>) -> Result<()> {
        match self {
            BulkOp::Upsert(doc) => {
                let meta = action_meta(version, &doc.index, &doc.doc_type, doc.id.as_deref(), doc.routing.as_deref());
                write_line(out, "index", meta)?;
                serde_json::to_writer(&mut *out, &doc.payload)?;
                out.push(b'\n');
            }
            BulkOp::Delete {
                index,
                doc_type,
                id,
                routing,
            } => {
                let meta = action_meta(version, index, doc_type, Some(id), routing.as_deref());
                write_line(out, "delete", meta)?;
            }
        }
        Ok(())
    }
}

fn action_meta(
    version: ApiVersion,
    index: &str,
    doc_type: &str,
    id: Option<&str>,
    routing: Option<&str>,
) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("_index".into(), Value::String(index.to_string()));
    if version.uses_types() {
        meta.insert("_type".into(), Value::String(doc_type.to_string()));
    }
    if let Some(id) = id {
        meta.insert("_id".into(), Value::String(id.to_string()));
    }
    if let Some(routing) = routing {
        meta.insert(version.routing_key().into(), Value::String(routing.to_string()));
    }
    meta
}

fn write_line(out: &mut Vec<u8>, action: &str, meta: Map<String, Value>) -> Result<()> {
    let mut line = Map::new();
    line.insert(action.to_string(), Value::Object(meta));
    serde_json::to_writer(&mut *out, &line)?;
    out.push(b'\n');
    Ok(())
}

// =============================================================================
// BulkBatch
// =============================================================================

/// Encoded operations awaiting one bulk request.
#[derive(Debug)]
pub struct BulkBatch {
    version: ApiVersion,
    body: Vec<u8>,
    upserts: usize,
    deletes: usize,
    /// When the first operation of this batch arrived.
    started: Option<Instant>,
}

impl BulkBatch {
    pub fn new(version: ApiVersion) -> Self {
        Self {
            version,
            body: Vec::new(),
            upserts: 0,
            deletes: 0,
            started: None,
        }
    }

    /// Encode `op` without appending it.
    pub fn encode(&self, op: &BulkOp) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        op.encode_into(self.version, &mut out)?;
        Ok(out)
    }

    /// Append one operation. Returns the bytes added.
    pub fn push(&mut self, op: &BulkOp) -> Result<usize> {
        let encoded = self.encode(op)?;
        self.push_encoded(&encoded, op.is_delete());
        Ok(encoded.len())
    }

    /// Append lines produced by [`encode`](Self::encode).
    pub fn push_encoded(&mut self, encoded: &[u8], is_delete: bool) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        self.body.extend_from_slice(encoded);
        if is_delete {
            self.deletes += 1;
        } else {
            self.upserts += 1;
        }
    }

    /// Whether appending `extra` bytes would take a non-empty batch past `max_bytes`.
    pub fn would_exceed(&self, extra: usize, max_bytes: usize) -> bool {
        !self.is_empty() && self.body.len() + extra > max_bytes
    }

    pub fn size_bytes(&self) -> usize {
        self.body.len()
    }

    pub fn len(&self) -> usize {
        self.upserts + self.deletes
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn upserts(&self) -> usize {
        self.upserts
    }

    pub fn deletes(&self) -> usize {
        self.deletes
    }

    pub fn has_deletes(&self) -> bool {
        self.deletes > 0
    }

    /// Time since the first buffered operation.
    pub fn age(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn clear(&mut self) {
        self.body.clear();
        self.upserts = 0;
        self.deletes = 0;
        self.started = None;
    }
}

// =============================================================================
// BulkPipeline
// =============================================================================

/// Result of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Items the target acknowledged.
    pub items: usize,
    /// Items the target rejected individually.
    pub failed: usize,
    pub bytes: usize,
    pub upserts: usize,
    pub deletes: usize,
}

/// Cumulative pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStats {
    pub flushes: usize,
    pub items_written: usize,
    pub items_failed: usize,
    pub bytes_written: usize,
    pub upserts: usize,
    pub deletes: usize,
    /// Largest batch sent, in bytes.
    pub largest_batch: usize,
}

impl BulkStats {
    fn record(&mut self, report: &FlushReport) {
        self.flushes += 1;
        self.items_written += report.items;
        self.items_failed += report.failed;
        self.bytes_written += report.bytes;
        self.upserts += report.upserts;
        self.deletes += report.deletes;
        self.largest_batch = self.largest_batch.max(report.bytes);
    }

    /// Fold another pipeline's counters into these.
    pub fn merge(&mut self, other: &BulkStats) {
        self.flushes += other.flushes;
        self.items_written += other.items_written;
        self.items_failed += other.items_failed;
        self.bytes_written += other.bytes_written;
        self.upserts += other.upserts;
        self.deletes += other.deletes;
        self.largest_batch = self.largest_batch.max(other.largest_batch);
    }
}

/// A batch bound to a target store.
pub struct BulkPipeline {
    target: Arc<dyn StoreAdapter>,
    batch: BulkBatch,
    max_bytes: usize,
    cooldown: Duration,
    retry: RetryConfig,
    name: String,
    stats: BulkStats,
}

impl BulkPipeline {
    pub fn new(target: Arc<dyn StoreAdapter>, max_bytes: usize, name: impl Into<String>) -> Self {
        let version = target.api_version();
        Self {
            target,
            batch: BulkBatch::new(version),
            max_bytes: max_bytes.max(1),
            cooldown: Duration::ZERO,
            retry: RetryConfig::none(),
            name: name.into(),
            stats: BulkStats::default(),
        }
    }

    /// Pipeline with the ceiling and cooldown from `config`.
    pub fn from_config(target: Arc<dyn StoreAdapter>, config: &BulkConfig, name: impl Into<String>) -> Self {
        Self::new(target, config.max_batch_bytes(), name).with_cooldown(config.cooldown())
    }

    /// Sleep applied after every successful flush.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Retry policy used by [`flush_retrying`](Self::flush_retrying) and
    /// size-triggered flushes.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn buffered_items(&self) -> usize {
        self.batch.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.batch.size_bytes()
    }

    pub fn batch_age(&self) -> Option<Duration> {
        self.batch.age()
    }

    pub fn stats(&self) -> BulkStats {
        self.stats
    }

    /// Queue one operation, flushing the current batch first if the
    /// operation would push it past the ceiling.
    ///
    /// Returns the report of that flush, if one happened.
    pub async fn submit(&mut self, op: BulkOp) -> Result<Option<FlushReport>> {
        let encoded = self.batch.encode(&op)?;
        let mut report = None;
        if self.batch.would_exceed(encoded.len(), self.max_bytes) {
            report = Some(self.flush_retrying().await?);
        }
        if encoded.len() > self.max_bytes {
            warn!(
                pipeline = %self.name,
                bytes = encoded.len(),
                max_bytes = self.max_bytes,
                "Single document exceeds bulk ceiling; sending it alone"
            );
        }
        self.batch.push_encoded(&encoded, op.is_delete());
        Ok(report)
    }

    /// Send the buffered batch as one bulk request.
    ///
    /// On success the batch is cleared and the cooldown applied. On failure
    /// the batch is kept intact so the caller may flush again.
    pub async fn flush(&mut self) -> Result<FlushReport> {
        if self.batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let bytes = self.batch.size_bytes();
        let start = Instant::now();
        let response = match self.target.bulk(self.batch.body().to_vec()).await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_bulk_failure(&self.name, e.kind());
                return Err(e);
            }
        };
        let elapsed = start.elapsed();

        let report = FlushReport {
            items: response.items,
            failed: response.failed,
            bytes,
            upserts: self.batch.upserts(),
            deletes: self.batch.deletes(),
        };
        self.batch.clear();
        self.stats.record(&report);
        metrics::record_bulk_flush(&self.name, bytes, report.items, report.failed, elapsed);

        debug!(
            pipeline = %self.name,
            items = report.items,
            failed = report.failed,
            bytes,
            upserts = report.upserts,
            deletes = report.deletes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Bulk flushed"
        );

        if !self.cooldown.is_zero() {
            tokio::time::sleep(self.cooldown).await;
        }
        Ok(report)
    }

    /// [`flush`](Self::flush) under the pipeline's retry policy.
    ///
    /// Batches carrying deletes are only re-sent when the policy allows it.
    pub async fn flush_retrying(&mut self) -> Result<FlushReport> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.flush().await {
                Ok(report) => return Ok(report),
                Err(e) => {
                    let has_deletes = self.batch.has_deletes();
                    if !self.retry.should_retry(&e, attempt, has_deletes) {
                        error!(
                            pipeline = %self.name,
                            attempt,
                            items = self.batch.len(),
                            has_deletes,
                            error = %e,
                            "Bulk flush failed"
                        );
                        return Err(e);
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        pipeline = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Bulk flush failed, retrying"
                    );
                    metrics::record_retry("bulk");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Drop the buffered batch without sending it. Returns the dropped item count.
    pub fn discard(&mut self) -> usize {
        let dropped = self.batch.len();
        self.batch.clear();
        dropped
    }
}

impl std::fmt::Debug for BulkPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkPipeline")
            .field("name", &self.name)
            .field("target", &self.target.name())
            .field("max_bytes", &self.max_bytes)
            .field("buffered_items", &self.batch.len())
            .field("stats", &self.stats)
            .finish()
    }
}
