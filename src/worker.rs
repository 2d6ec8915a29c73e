// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk worker for producer/worker (copy) mode.
//!
//! Producers push raw scroll hits onto one bounded channel; any number of
//! workers drain it, each with a private [`BulkPipeline`]. Workers share no
//! mutable state apart from the receiving end of the channel.
//!
//! # Timers
//!
//! Each worker runs three independent timers:
//!
//! | Timer | Armed | On fire |
//! |-------|-------|---------|
//! | idle | reset on every input | flush whatever is buffered, keep running |
//! | fatal | reset on every input | final flush, exit (producer is gone) |
//! | max batch age | when the buffer becomes non-empty | flush a steadily trickling buffer |
//!
//! Closing the channel (dropping every sender) is the only cancellation
//! signal: the worker flushes its partial batch and exits. There is no
//! mid-batch abort.

use crate::bulk::{BulkOp, BulkPipeline, BulkStats};
use crate::config::BulkConfig;
use crate::document::{IngestTransform, SourceRecord};
use crate::error::Result;
use crate::metrics;
use crate::resilience::RateLimiter;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Receiving end shared by all workers of one run.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<Value>>>;

/// Bounded channel whose receiver can be shared by several workers.
pub fn shared_channel(capacity: usize) -> (mpsc::Sender<Value>, SharedReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Arc::new(Mutex::new(rx)))
}

/// Timer and throttle settings for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub idle_timeout: Duration,
    pub fatal_timeout: Duration,
    pub max_batch_age: Duration,
    pub max_docs_per_sec: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_bulk(&BulkConfig::default())
    }
}

impl WorkerConfig {
    pub fn from_bulk(config: &BulkConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout_duration(),
            fatal_timeout: config.fatal_timeout_duration(),
            max_batch_age: config.max_batch_age_duration(),
            max_docs_per_sec: config.max_docs_per_sec,
        }
    }

    /// Short timers for tests.
    pub fn testing() -> Self {
        Self {
            idle_timeout: Duration::from_millis(50),
            fatal_timeout: Duration::from_secs(5),
            max_batch_age: Duration::from_secs(1),
            max_docs_per_sec: None,
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every sender was dropped.
    ChannelClosed,
    /// No input for `fatal_timeout`.
    FatalTimeout,
}

/// Summary of one worker's run.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub exit: WorkerExit,
    /// Hits taken off the channel.
    pub received: usize,
    /// Hits dropped as malformed.
    pub skipped: usize,
    pub idle_flushes: usize,
    pub age_flushes: usize,
    pub stats: BulkStats,
}

/// One consumer of the shared channel.
pub struct BulkWorker {
    id: usize,
    rx: SharedReceiver,
    pipeline: BulkPipeline,
    transform: Arc<IngestTransform>,
    config: WorkerConfig,
    limiter: Option<RateLimiter>,
}

impl BulkWorker {
    pub fn new(
        id: usize,
        rx: SharedReceiver,
        pipeline: BulkPipeline,
        transform: Arc<IngestTransform>,
        config: WorkerConfig,
    ) -> Self {
        let limiter = config.max_docs_per_sec.map(RateLimiter::per_second);
        Self {
            id,
            rx,
            pipeline,
            transform,
            config,
            limiter,
        }
    }

    /// Consume until the channel closes or the fatal timer fires.
    ///
    /// A flush that still fails after the pipeline's retry policy ends the
    /// worker with that error.
    pub async fn run(mut self) -> Result<WorkerReport> {
        let worker = self.pipeline.name().to_string();
        let mut report = WorkerReport {
            worker_id: self.id,
            exit: WorkerExit::ChannelClosed,
            received: 0,
            skipped: 0,
            idle_flushes: 0,
            age_flushes: 0,
            stats: BulkStats::default(),
        };

        let now = Instant::now();
        let mut idle_deadline = now + self.config.idle_timeout;
        let mut fatal_deadline = now + self.config.fatal_timeout;
        let mut age_deadline: Option<Instant> = None;

        debug!(worker = %worker, "Worker started");

        loop {
            let rx = Arc::clone(&self.rx);
            let next = async move { rx.lock().await.recv().await };

            tokio::select! {
                biased;

                message = next => {
                    let Some(hit) = message else {
                        debug!(worker = %worker, "Channel closed, flushing final batch");
                        report.exit = WorkerExit::ChannelClosed;
                        break;
                    };
                    report.received += 1;
                    let now = Instant::now();
                    idle_deadline = now + self.config.idle_timeout;
                    fatal_deadline = now + self.config.fatal_timeout;

                    if let Some(ref limiter) = self.limiter {
                        limiter.acquire().await;
                    }
                    if !self.ingest(hit).await? {
                        report.skipped += 1;
                    }

                    if self.pipeline.buffered_items() == 0 {
                        age_deadline = None;
                    } else if age_deadline.is_none() {
                        age_deadline = Some(Instant::now() + self.config.max_batch_age);
                    }
                }

                _ = sleep_until(idle_deadline) => {
                    if self.pipeline.buffered_items() > 0 {
                        debug!(worker = %worker, items = self.pipeline.buffered_items(), "Idle timeout, flushing");
                        metrics::record_worker_timer(&worker, "idle");
                        self.pipeline.flush_retrying().await?;
                        report.idle_flushes += 1;
                        age_deadline = None;
                    }
                    idle_deadline = Instant::now() + self.config.idle_timeout;
                }

                _ = sleep_until(fatal_deadline) => {
                    warn!(
                        worker = %worker,
                        timeout_secs = self.config.fatal_timeout.as_secs(),
                        "No input before fatal timeout, stopping worker"
                    );
                    metrics::record_worker_timer(&worker, "fatal");
                    report.exit = WorkerExit::FatalTimeout;
                    break;
                }

                _ = sleep_until(age_deadline.unwrap_or(fatal_deadline)), if age_deadline.is_some() => {
                    debug!(worker = %worker, items = self.pipeline.buffered_items(), "Batch age reached, flushing");
                    metrics::record_worker_timer(&worker, "max_age");
                    self.pipeline.flush_retrying().await?;
                    report.age_flushes += 1;
                    age_deadline = None;
                }
            }
        }

        self.pipeline.flush_retrying().await?;
        report.stats = self.pipeline.stats();

        info!(
            worker = %worker,
            exit = ?report.exit,
            received = report.received,
            skipped = report.skipped,
            flushes = report.stats.flushes,
            items = report.stats.items_written,
            "Worker finished"
        );
        Ok(report)
    }

    /// Decode, transform and queue one hit. Returns `false` if it was skipped.
    async fn ingest(&mut self, hit: Value) -> Result<bool> {
        let envelope = match SourceRecord::from_hit(hit).and_then(|record| self.transform.apply(record)) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(worker = %self.pipeline.name(), error = %e, "Skipping malformed record");
                metrics::record_record_skipped("source");
                return Ok(false);
            }
        };
        self.pipeline.submit(BulkOp::Upsert(envelope)).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn hit(id: &str) -> Value {
        json!({"_index": "src", "_type": "doc", "_id": id, "_source": {"id": id}})
    }

    fn worker(store: Arc<MemoryStore>, rx: SharedReceiver, config: WorkerConfig) -> BulkWorker {
        let pipeline = BulkPipeline::new(store, 1 << 20, "worker-0");
        BulkWorker::new(0, rx, pipeline, Arc::new(IngestTransform::passthrough()), config)
    }

    #[tokio::test]
    async fn test_channel_close_flushes_and_exits() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = shared_channel(16);
        let handle = tokio::spawn(worker(store.clone(), rx, WorkerConfig::default()).run());

        for i in 0..5 {
            tx.send(hit(&format!("d{}", i))).await.unwrap();
        }
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.exit, WorkerExit::ChannelClosed);
        assert_eq!(report.received, 5);
        assert_eq!(report.stats.items_written, 5);
        assert_eq!(store.count("src").await, 5);
        assert_eq!(store.bulk_calls().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_flushes_and_keeps_running() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = shared_channel(16);
        let config = WorkerConfig {
            idle_timeout: Duration::from_secs(5),
            fatal_timeout: Duration::from_secs(300),
            max_batch_age: Duration::from_secs(60),
            max_docs_per_sec: None,
        };
        let handle = tokio::spawn(worker(store.clone(), rx, config).run());

        for i in 0..3 {
            tx.send(hit(&format!("d{}", i))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.bulk_calls().await, 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.bulk_calls().await, 1);
        assert_eq!(store.count("src").await, 3);

        tx.send(hit("d3")).await.unwrap();
        drop(tx);
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.exit, WorkerExit::ChannelClosed);
        assert_eq!(report.idle_flushes, 1);
        assert_eq!(store.count("src").await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_timeout_exits_after_final_flush() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = shared_channel(16);
        let config = WorkerConfig {
            idle_timeout: Duration::from_secs(600),
            fatal_timeout: Duration::from_secs(10),
            max_batch_age: Duration::from_secs(600),
            max_docs_per_sec: None,
        };
        let handle = tokio::spawn(worker(store.clone(), rx, config).run());

        tx.send(hit("a")).await.unwrap();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.exit, WorkerExit::FatalTimeout);
        assert_eq!(store.count("src").await, 1);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_batch_age_flushes_trickle() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = shared_channel(16);
        let config = WorkerConfig {
            idle_timeout: Duration::from_secs(5),
            fatal_timeout: Duration::from_secs(300),
            max_batch_age: Duration::from_secs(10),
            max_docs_per_sec: None,
        };
        let handle = tokio::spawn(worker(store.clone(), rx, config).run());

        // One document every 3s never lets the idle timer fire.
        for i in 0..4 {
            tx.send(hit(&format!("d{}", i))).await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        assert_eq!(store.bulk_calls().await, 1);

        drop(tx);
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.age_flushes, 1);
        assert_eq!(report.idle_flushes, 0);
        assert_eq!(store.count("src").await, 4);
    }

    #[tokio::test]
    async fn test_malformed_hits_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = shared_channel(16);
        let handle = tokio::spawn(worker(store.clone(), rx, WorkerConfig::testing()).run());

        tx.send(hit("good")).await.unwrap();
        tx.send(json!({"status": 404, "response": "missing"})).await.unwrap();
        tx.send(json!({"_index": "src", "_id": "no-type", "_source": {}})).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.received, 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(store.count("src").await, 1);
    }

    #[tokio::test]
    async fn test_workers_share_channel() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = shared_channel(8);
        let mut handles = Vec::new();
        for id in 0..3 {
            let pipeline = BulkPipeline::new(store.clone(), 1 << 20, format!("worker-{}", id));
            let w = BulkWorker::new(
                id,
                rx.clone(),
                pipeline,
                Arc::new(IngestTransform::passthrough()),
                WorkerConfig::testing(),
            );
            handles.push(tokio::spawn(w.run()));
        }

        for i in 0..100 {
            tx.send(hit(&format!("d{:03}", i))).await.unwrap();
        }
        drop(tx);

        let mut received = 0;
        for handle in handles {
            received += handle.await.unwrap().unwrap().received;
        }
        assert_eq!(received, 100);
        assert_eq!(store.count("src").await, 100);
    }

    #[tokio::test]
    async fn test_flush_failure_ends_worker() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_bulks(10);
        let (tx, rx) = shared_channel(4);
        let handle = tokio::spawn(worker(store, rx, WorkerConfig::testing()).run());

        tx.send(hit("a")).await.unwrap();
        drop(tx);
        assert!(handle.await.unwrap().is_err());
    }
}
