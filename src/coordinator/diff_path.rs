// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync mode: one merge-diff pass over source and target.

use crate::bulk::BulkPipeline;
use crate::config::SyncConfig;
use crate::diff::{DiffEngine, DiffError, DiffStats};
use crate::document::IngestTransform;
use crate::store::{ScrollRequest, StoreAdapter};
use std::sync::Arc;

/// Diff the source against the target and write the difference.
///
/// Both sides are scanned with the same page size, query, sort and field
/// projection, so payloads compare like for like.
pub async fn run_sync(
    source: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    config: &SyncConfig,
    source_request: ScrollRequest,
) -> Result<DiffStats, DiffError> {
    let transform = IngestTransform::from_config(&config.transform).map_err(|e| DiffError {
        source: e,
        stats: DiffStats::default(),
    })?;

    let target_request = ScrollRequest {
        indices: config.target_indices(),
        ..source_request.clone()
    };
    let pipeline = BulkPipeline::from_config(target.clone(), &config.bulk, "sync").with_retry(config.retry.retry_config());

    DiffEngine::new(source, target, source_request, target_request, transform, pipeline)
        .run()
        .await
}
