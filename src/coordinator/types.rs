// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Run state and reporting types.
//!
//! # State Transitions
//!
//! ```text
//!                 run()
//! Created ───────────────→ Connecting ──→ Preparing ──→ Running ──→ Finalizing ──→ Completed
//!                              │              │            │             │
//!                              └──────────────┴────────────┴─────────────┴──────→ Failed
//! ```
//!
//! - **Created**: `Migrator` built, nothing contacted yet.
//! - **Connecting**: Resolving adapters and checking cluster readiness.
//! - **Preparing**: Relaxing the target's refresh interval.
//! - **Running**: Copy or sync in progress.
//! - **Finalizing**: Restoring settings and refreshing the target.
//! - **Completed** / **Failed**: Terminal.

use crate::config::SyncMode;
use crate::diff::DiffStats;
use crate::worker::WorkerReport;
use std::time::Duration;

/// State of one migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Connecting,
    Preparing,
    Running,
    Finalizing,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Created => write!(f, "Created"),
            RunState::Connecting => write!(f, "Connecting"),
            RunState::Preparing => write!(f, "Preparing"),
            RunState::Running => write!(f, "Running"),
            RunState::Finalizing => write!(f, "Finalizing"),
            RunState::Completed => write!(f, "Completed"),
            RunState::Failed => write!(f, "Failed"),
        }
    }
}

/// Output of one producer task in copy mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub slice_id: usize,
    pub pages: usize,
    pub docs: usize,
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: SyncMode,
    pub source_docs: usize,
    /// Zero in copy mode, which never reads the target.
    pub target_docs: usize,
    pub upserts: usize,
    pub deletes: usize,
    pub skipped: usize,
    pub bulk_requests: usize,
    pub items_written: usize,
    /// Items the target rejected inside otherwise successful bulk calls.
    pub items_failed: usize,
    pub bytes_written: usize,
    pub elapsed: Duration,
    /// Per-worker detail, copy mode only.
    pub workers: Vec<WorkerReport>,
    /// Diff counters, sync mode only.
    pub diff: Option<DiffStats>,
}

impl RunReport {
    /// Build a sync-mode report from the diff counters.
    pub fn from_diff(stats: DiffStats, elapsed: Duration) -> Self {
        Self {
            mode: SyncMode::Sync,
            source_docs: stats.source_docs,
            target_docs: stats.target_docs,
            upserts: stats.upserts,
            deletes: stats.deletes,
            skipped: stats.skipped,
            bulk_requests: stats.bulk.flushes,
            items_written: stats.bulk.items_written,
            items_failed: stats.bulk.items_failed,
            bytes_written: stats.bulk.bytes_written,
            elapsed,
            workers: Vec::new(),
            diff: Some(stats),
        }
    }

    /// Build a copy-mode report from producer and worker summaries.
    pub fn from_copy(producers: &[ProducerReport], workers: Vec<WorkerReport>, elapsed: Duration) -> Self {
        let mut report = Self {
            mode: SyncMode::Copy,
            source_docs: producers.iter().map(|p| p.docs).sum(),
            target_docs: 0,
            upserts: 0,
            deletes: 0,
            skipped: 0,
            bulk_requests: 0,
            items_written: 0,
            items_failed: 0,
            bytes_written: 0,
            elapsed,
            workers: Vec::new(),
            diff: None,
        };
        for worker in &workers {
            report.upserts += worker.stats.upserts;
            report.skipped += worker.skipped;
            report.bulk_requests += worker.stats.flushes;
            report.items_written += worker.stats.items_written;
            report.items_failed += worker.stats.items_failed;
            report.bytes_written += worker.stats.bytes_written;
        }
        report.workers = workers;
        report
    }
}
