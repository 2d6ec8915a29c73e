// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Index Sync
//!
//! Copies or incrementally synchronizes documents from a source search
//! cluster to a target cluster.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               index-sync                                  │
//! │                                                                           │
//! │  ┌──────────────┐   sync   ┌────────────┐    ┌──────────────┐             │
//! │  │ ScrollCursor │─────────►│ DiffEngine │───►│ BulkPipeline │──► target   │
//! │  │ (per side)   │          │ (merge)    │    │ (size-bound) │             │
//! │  └──────────────┘          └────────────┘    └──────────────┘             │
//! │         │                                            ▲                    │
//! │         │ copy   ┌─────────────────┐   ┌──────────────┴──┐                │
//! │         └───────►│ producers/slice │──►│ BulkWorker × N  │                │
//! │                  └─────────────────┘   └─────────────────┘                │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Modes
//!
//! 1. **Copy**: scan the source and bulk-index every document, with
//!    parallel producers (one per scroll slice) and workers.
//! 2. **Sync**: walk source and target in id order and write only what
//!    differs: upserts for new or changed documents, deletes for documents
//!    gone from the source.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use index_sync::{ClusterConfig, Migrator, SyncConfig, SyncMode};
//!
//! #[tokio::main]
//! async fn main() -> index_sync::Result<()> {
//!     let config = SyncConfig {
//!         mode: SyncMode::Sync,
//!         source: ClusterConfig::for_testing("http://old:9200", "products"),
//!         target: ClusterConfig::for_testing("http://new:9200", "products"),
//!         ..Default::default()
//!     };
//!     let report = Migrator::new(config)?.run().await?;
//!     println!("{} upserts, {} deletes", report.upserts, report.deletes);
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod diff;
pub mod document;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod store;
pub mod worker;

// Re-exports for convenience
pub use bulk::{BulkOp, BulkPipeline, BulkStats};
pub use config::{BulkConfig, ClusterConfig, ScanConfig, SyncConfig, SyncMode, TransformConfig};
pub use coordinator::{Migrator, RunReport, RunState};
pub use cursor::{CursorSource, EmptyCursor, ScrollCursor};
pub use diff::{ChangeKind, ChangeSet, DiffEngine, DiffError, DiffState, DiffStats};
pub use document::{DocumentEnvelope, IngestTransform, SourceRecord};
pub use error::{Result, SyncError};
pub use store::{ApiVersion, StoreAdapter};
pub use worker::{BulkWorker, WorkerReport};
