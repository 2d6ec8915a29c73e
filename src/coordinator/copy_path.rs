// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Copy mode: producers scan the source, workers bulk-write the target.
//!
//! ```text
//!  slice 0 producer ──┐                      ┌──▶ worker 0 ──▶ bulk
//!  slice 1 producer ──┼──▶ bounded channel ──┼──▶ worker 1 ──▶ bulk
//!  slice N producer ──┘                      └──▶ worker M ──▶ bulk
//! ```
//!
//! Producers hand over raw hits; decoding and transformation happen in the
//! workers. When every producer has finished, its sender is dropped and the
//! workers drain the channel and exit.

use super::types::ProducerReport;
use crate::bulk::BulkPipeline;
use crate::config::SyncConfig;
use crate::document::IngestTransform;
use crate::error::{Result, SyncError};
use crate::store::{ScrollRequest, StoreAdapter};
use crate::worker::{shared_channel, BulkWorker, WorkerConfig, WorkerReport};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

/// Run producers and workers to completion.
pub async fn run_copy(
    source: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    config: &SyncConfig,
    request: ScrollRequest,
) -> Result<(Vec<ProducerReport>, Vec<WorkerReport>)> {
    let transform = Arc::new(IngestTransform::from_config(&config.transform)?);

    let mut slices = config.scan.slices.max(1);
    if slices > 1 && !source.api_version().supports_slices() {
        warn!(
            slices,
            version = ?source.api_version(),
            "Source does not support sliced scrolls; scanning with one producer"
        );
        slices = 1;
    }

    let capacity = config.bulk.channel_capacity.unwrap_or(config.scan.doc_buffer_count);
    let (tx, rx) = shared_channel(capacity);

    let mut workers = JoinSet::new();
    for worker_id in 0..config.bulk.workers.max(1) {
        let pipeline = BulkPipeline::from_config(target.clone(), &config.bulk, format!("copy-{}", worker_id))
            .with_retry(config.retry.retry_config());
        let worker = BulkWorker::new(
            worker_id,
            rx.clone(),
            pipeline,
            transform.clone(),
            WorkerConfig::from_bulk(&config.bulk),
        );
        workers.spawn(worker.run().instrument(info_span!("copy_worker", worker_id)));
    }
    // Workers now own the receiver; once they all exit, producers see a closed channel.
    drop(rx);

    let mut producers = JoinSet::new();
    for slice_id in 0..slices {
        let request = if slices > 1 {
            request.clone().with_slice(slice_id, slices)
        } else {
            request.clone()
        };
        let source = source.clone();
        let tx = tx.clone();
        producers.spawn(produce(source, request, tx).instrument(info_span!("copy_producer", slice_id)));
    }
    drop(tx);

    info!(slices, workers = config.bulk.workers.max(1), capacity, "Copy started");

    let mut first_error: Option<SyncError> = None;
    let mut producer_reports = Vec::with_capacity(slices);
    while let Some(joined) = producers.join_next().await {
        match joined {
            Ok(Ok(report)) => producer_reports.push(report),
            Ok(Err(e)) => keep_first(&mut first_error, e),
            Err(e) => keep_first(&mut first_error, SyncError::Internal(format!("producer task failed: {}", e))),
        }
    }

    let mut worker_reports = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(report)) => worker_reports.push(report),
            Ok(Err(e)) => keep_first(&mut first_error, e),
            Err(e) => keep_first(&mut first_error, SyncError::Internal(format!("worker task failed: {}", e))),
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    producer_reports.sort_by_key(|p| p.slice_id);
    worker_reports.sort_by_key(|w| w.worker_id);
    Ok((producer_reports, worker_reports))
}

/// Prefer a real failure over the `Shutdown` a producer sees when the
/// workers have already gone.
fn keep_first(slot: &mut Option<SyncError>, error: SyncError) {
    match slot {
        None => *slot = Some(error),
        Some(SyncError::Shutdown) if !matches!(error, SyncError::Shutdown) => *slot = Some(error),
        Some(_) => debug!(error = %error, "Additional copy failure"),
    }
}

/// Scan one slice and push every hit onto the channel.
///
/// The scroll is released whether or not the scan succeeds.
async fn produce(
    source: Arc<dyn StoreAdapter>,
    request: ScrollRequest,
    tx: mpsc::Sender<Value>,
) -> Result<ProducerReport> {
    let mut report = ProducerReport {
        slice_id: request.slice_id,
        ..Default::default()
    };

    let first = source.open_scroll(&request).await?;
    let mut scroll_id = first.scroll_id.clone();
    debug!(total_hits = first.total_hits, "Producer scroll opened");

    let result: Result<()> = async {
        let mut page = first;
        loop {
            report.pages += 1;
            let fetched = page.hits.len();
            for hit in page.hits {
                tx.send(hit).await.map_err(|_| SyncError::Shutdown)?;
            }
            report.docs += fetched;
            crate::metrics::record_docs_scanned("source", fetched);

            if fetched < request.page_size {
                return Ok::<(), SyncError>(());
            }
            let Some(ref id) = scroll_id else {
                return Ok(());
            };
            page = source.next_scroll(&request.scroll_time, id).await?;
            if page.scroll_id.is_some() {
                scroll_id = page.scroll_id.clone();
            }
        }
    }
    .await;

    if let Some(ref id) = scroll_id {
        if let Err(e) = source.clear_scroll(id).await {
            warn!(error = %e, "Failed to release producer scroll");
        }
    }

    result.map(|()| {
        debug!(pages = report.pages, docs = report.docs, "Producer finished");
        report
    })
}
