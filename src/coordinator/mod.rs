// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migration coordinator.
//!
//! The run entry point that ties together:
//! - Store adapters resolved per cluster via [`crate::store::select`]
//! - Readiness checks against both clusters
//! - Target settings relax/restore via [`settings::SettingsGuard`]
//! - Copy mode (producers + [`crate::worker::BulkWorker`]s) or sync mode
//!   ([`crate::diff::DiffEngine`])
//!
//! # Lifecycle
//!
//! 1. Resolve adapters (probe `GET /` for the API dialect)
//! 2. Check cluster health (`wait_for_green` makes yellow/red fatal)
//! 3. Disable refresh on the target indices
//! 4. Copy or sync
//! 5. Restore refresh intervals and refresh, whatever the outcome of 4

mod copy_path;
mod diff_path;
mod settings;
mod types;

pub use copy_path::run_copy;
pub use diff_path::run_sync;
pub use settings::SettingsGuard;
pub use types::{ProducerReport, RunReport, RunState};

use crate::config::{SyncConfig, SyncMode};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::store::select::resolve_adapter;
use crate::store::{ScrollRequest, StoreAdapter};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// One configured migration between two clusters.
///
/// Stores are resolved from the config on [`run`](Self::run) unless they
/// were injected with [`with_stores`](Self::with_stores).
pub struct Migrator {
    config: SyncConfig,
    source: Option<Arc<dyn StoreAdapter>>,
    target: Option<Arc<dyn StoreAdapter>>,
    state_tx: watch::Sender<RunState>,
    state_rx: watch::Receiver<RunState>,
}

impl Migrator {
    /// Validate `config` and build a migrator that connects on `run`.
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(RunState::Created);
        Ok(Self {
            config,
            source: None,
            target: None,
            state_tx,
            state_rx,
        })
    }

    /// Use already-built adapters instead of probing the configured URLs.
    pub fn with_stores(mut self, source: Arc<dyn StoreAdapter>, target: Arc<dyn StoreAdapter>) -> Self {
        self.source = Some(source);
        self.target = Some(target);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }

    /// Watch state changes, e.g. from a progress reporter.
    pub fn state_receiver(&self) -> watch::Receiver<RunState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: RunState) {
        let _ = self.state_tx.send(state);
        metrics::set_run_state(&state.to_string());
    }

    /// Run the migration once.
    ///
    /// A migrator can only run from `Created`.
    pub async fn run(&self) -> Result<RunReport> {
        if self.state() != RunState::Created {
            return Err(SyncError::Internal(format!(
                "migrator already ran (state {})",
                self.state()
            )));
        }

        let mode = self.config.mode;
        let start = Instant::now();
        info!(
            mode = %mode,
            source = %self.config.source.url,
            target = %self.config.target.url,
            indices = %self.config.source.indices,
            "Starting migration"
        );

        let result = self.run_inner().await;
        let elapsed = start.elapsed();
        metrics::record_run_complete(&mode.to_string(), result.is_ok(), elapsed);

        match result {
            Ok(mut report) => {
                report.elapsed = elapsed;
                self.set_state(RunState::Completed);
                info!(
                    mode = %mode,
                    source_docs = report.source_docs,
                    target_docs = report.target_docs,
                    upserts = report.upserts,
                    deletes = report.deletes,
                    skipped = report.skipped,
                    bulk_requests = report.bulk_requests,
                    items_written = report.items_written,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Migration complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.set_state(RunState::Failed);
                error!(mode = %mode, error = %e, elapsed_ms = elapsed.as_millis() as u64, "Migration failed");
                Err(e)
            }
        }
    }

    async fn run_inner(&self) -> Result<RunReport> {
        self.set_state(RunState::Connecting);
        let (source, target) = self.stores().await?;
        check_ready(source.as_ref(), "source", self.config.wait_for_green).await?;
        check_ready(target.as_ref(), "target", self.config.wait_for_green).await?;

        self.set_state(RunState::Preparing);
        let target_indices = self.config.target_indices();
        let guard = SettingsGuard::relax(target.clone(), &target_indices).await;

        self.set_state(RunState::Running);
        let request = scroll_request(&self.config);
        let start = Instant::now();
        let outcome = match self.config.mode {
            SyncMode::Copy => run_copy(source, target, &self.config, request)
                .await
                .map(|(producers, workers)| RunReport::from_copy(&producers, workers, start.elapsed())),
            SyncMode::Sync => match run_sync(source, target, &self.config, request).await {
                Ok(stats) => Ok(RunReport::from_diff(stats, start.elapsed())),
                Err(e) => {
                    error!(
                        source_docs = e.stats.source_docs,
                        target_docs = e.stats.target_docs,
                        upserts = e.stats.upserts,
                        deletes = e.stats.deletes,
                        undelivered = e.stats.undelivered,
                        "Sync stopped before converging"
                    );
                    Err(e.into())
                }
            },
        };

        self.set_state(RunState::Finalizing);
        // Refresh only after a successful run.
        let restored = guard.restore(self.config.refresh && outcome.is_ok()).await;

        let report = outcome?;
        if let Err(e) = restored {
            warn!(error = %e, "Run succeeded but target settings were not fully restored");
            return Err(e);
        }
        Ok(report)
    }

    async fn stores(&self) -> Result<(Arc<dyn StoreAdapter>, Arc<dyn StoreAdapter>)> {
        let source = match self.source {
            Some(ref store) => store.clone(),
            None => resolve_adapter(&self.config.source, "source").await?,
        };
        let target = match self.target {
            Some(ref store) => store.clone(),
            None => resolve_adapter(&self.config.target, "target").await?,
        };
        Ok((source, target))
    }
}

/// Refuse to start against a cluster that is not ready.
pub async fn check_ready(store: &dyn StoreAdapter, side: &str, wait_for_green: bool) -> Result<()> {
    let health = store.cluster_health().await?;
    if !health.is_ready(wait_for_green) {
        return Err(SyncError::ClusterNotReady {
            cluster: format!("{} ({})", side, store.name()),
            status: health.status.to_string(),
        });
    }
    info!(side, cluster = %health.cluster_name, status = %health.status, "Cluster ready");
    Ok(())
}

/// Source scroll request built from the scan section.
pub fn scroll_request(config: &SyncConfig) -> ScrollRequest {
    let scan = &config.scan;
    ScrollRequest {
        scroll_time: scan.scroll_time.clone(),
        query: scan.query.clone(),
        sort_field: scan.sort_field.clone(),
        fields: scan.fields.clone(),
        ..ScrollRequest::new(config.source.indices.clone(), scan.doc_buffer_count)
    }
}
