// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Merge-diff engine.
//!
//! Walks the source and target cursors in ascending id order and computes
//! the upserts and deletes that make the target equal to the source.
//!
//! # Algorithm
//!
//! Both streams are sorted by id, so the engine behaves like a merge join
//! with lookahead buffers:
//!
//! ```text
//!   source page ──┐                       ┌──▶ upsert (missing or different on target)
//!                 ├──▶ MergeState ────────┤
//!   target page ──┘   pending_source      └──▶ delete (absent from source)
//!                     pending_target
//! ```
//!
//! - A target document whose id is waiting in `pending_source` is compared
//!   with it and the match is consumed; otherwise it waits in
//!   `pending_target`.
//! - A source document whose id is waiting in `pending_target` is compared
//!   and consumed. Otherwise, if the target frontier is already past it (or
//!   the target is exhausted) it is missing on the target; if not, it waits
//!   in `pending_source`.
//! - After each round, buffered ids that the other side has passed are
//!   decided: source leftovers become upserts, target leftovers deletes.
//! - The side that is behind advances next; equal frontiers advance both.
//!   A side whose full pages held no valid record has no frontier yet and
//!   counts as behind.
//!
//! Every round's changes are flushed through the [`BulkPipeline`] before the
//! next round, so memory is bounded by one page per side plus the gap
//! between the two frontiers.
//!
//! # States
//!
//! ```text
//! Init ──▶ OpenSourceCursor ──▶ OpenTargetCursor ──▶ Iterate* ──▶ DrainRemainder ──▶ CloseCursors ──▶ Done
//!                │                                      │              │                 ▲
//!                └──────────────── error ───────────────┴──────────────┴─────────────────┘ ──▶ Failed
//! ```
//!
//! Neither terminal state is reached before both cursors are released.

use crate::bulk::{BulkOp, BulkPipeline, BulkStats};
use crate::cursor::{CursorSource, EmptyCursor, RecordPage, ScrollCursor};
use crate::document::{IngestTransform, SourceRecord};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::store::{ScrollRequest, StoreAdapter};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Change set
// =============================================================================

/// What to do with one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    Upsert,
    Delete,
}

/// One scheduled change.
///
/// For an upsert `record` is the source document; for a delete it is the
/// target document being removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub record: SourceRecord,
}

impl Change {
    /// Turn this change into a bulk operation for the target.
    ///
    /// Deletes take the inferred source type when one is known, else the
    /// target document's own type; index and type overrides apply to both.
    pub fn into_op(self, transform: &IngestTransform, inferred_type: Option<&str>) -> Result<BulkOp> {
        match self.kind {
            ChangeKind::Upsert => Ok(BulkOp::Upsert(transform.apply(self.record)?)),
            ChangeKind::Delete => {
                let SourceRecord {
                    index,
                    doc_type,
                    id,
                    routing,
                    ..
                } = self.record;
                let doc_type = inferred_type.map(str::to_string).unwrap_or(doc_type);
                let (index, doc_type) = transform.route(index, doc_type);
                Ok(BulkOp::Delete {
                    index,
                    doc_type,
                    id,
                    routing,
                })
            }
        }
    }
}

/// Changes produced by one round, keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: BTreeMap<String, Change>,
    /// Type of the most recently observed source document.
    inferred_type: Option<String>,
}

impl ChangeSet {
    pub fn upsert(&mut self, record: SourceRecord) {
        self.insert(ChangeKind::Upsert, record);
    }

    pub fn delete(&mut self, record: SourceRecord) {
        self.insert(ChangeKind::Delete, record);
    }

    fn insert(&mut self, kind: ChangeKind, record: SourceRecord) {
        let id = record.id.clone();
        if let Some(previous) = self.changes.insert(id, Change { kind, record }) {
            // Only possible when a scanned pattern spans indices sharing ids.
            warn!(id = %previous.record.id, "Id scheduled twice in one round; keeping the later change");
        }
    }

    pub fn get(&self, id: &str) -> Option<&Change> {
        self.changes.get(id)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn upserts(&self) -> usize {
        self.changes.values().filter(|c| c.kind == ChangeKind::Upsert).count()
    }

    pub fn deletes(&self) -> usize {
        self.changes.values().filter(|c| c.kind == ChangeKind::Delete).count()
    }

    pub fn inferred_type(&self) -> Option<&str> {
        self.inferred_type.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }

    /// Changes in ascending id order.
    pub fn into_changes(self) -> impl Iterator<Item = Change> {
        self.changes.into_values()
    }
}

// =============================================================================
// Merge state
// =============================================================================

/// Which side(s) to fetch next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Both,
    SourceOnly,
    TargetOnly,
    Done,
}

/// Pure merge-join state: no I/O, fed one decoded page at a time.
#[derive(Debug, Default)]
pub struct MergeState {
    pending_source: BTreeMap<String, SourceRecord>,
    pending_target: BTreeMap<String, SourceRecord>,
    last_src_id: Option<String>,
    last_dst_id: Option<String>,
    last_src_type: Option<String>,
    src_exhausted: bool,
    dst_exhausted: bool,
    changes: ChangeSet,
    unchanged: usize,
}

impl MergeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one target page.
    pub fn absorb_target_page(&mut self, records: Vec<SourceRecord>, exhausted: bool) -> Result<()> {
        check_ascending("target", self.last_dst_id.as_deref(), &records)?;
        if let Some(last) = records.last() {
            self.last_dst_id = Some(last.id.clone());
        }

        for doc in records {
            match self.pending_source.remove(&doc.id) {
                Some(src) => self.compare(src, &doc),
                None => {
                    self.pending_target.insert(doc.id.clone(), doc);
                }
            }
        }
        self.dst_exhausted = exhausted;
        Ok(())
    }

    /// Classify one source page. Call after the target page of the same round.
    pub fn absorb_source_page(&mut self, records: Vec<SourceRecord>, exhausted: bool) -> Result<()> {
        check_ascending("source", self.last_src_id.as_deref(), &records)?;
        if let Some(last) = records.last() {
            self.last_src_id = Some(last.id.clone());
            self.last_src_type = Some(last.doc_type.clone());
        }

        for doc in records {
            if let Some(dst) = self.pending_target.remove(&doc.id) {
                self.compare(doc, &dst);
                continue;
            }
            let target_passed = match self.last_dst_id {
                Some(ref dst) => doc.id.as_str() < dst.as_str(),
                None => false,
            };
            if target_passed || self.dst_exhausted {
                self.changes.upsert(doc);
            } else {
                self.pending_source.insert(doc.id.clone(), doc);
            }
        }
        self.src_exhausted = exhausted;
        Ok(())
    }

    fn compare(&mut self, src: SourceRecord, dst: &SourceRecord) {
        if src.source == dst.source {
            self.unchanged += 1;
        } else {
            self.changes.upsert(src);
        }
    }

    /// Decide buffered ids the other side has already passed.
    pub fn settle(&mut self) {
        let upserts = if self.dst_exhausted {
            std::mem::take(&mut self.pending_source)
        } else if let Some(ref dst) = self.last_dst_id {
            let ahead = self.pending_source.split_off(dst.as_str());
            std::mem::replace(&mut self.pending_source, ahead)
        } else {
            BTreeMap::new()
        };
        for (_, record) in upserts {
            self.changes.upsert(record);
        }

        let deletes = if self.src_exhausted {
            std::mem::take(&mut self.pending_target)
        } else if let Some(ref src) = self.last_src_id {
            let ahead = self.pending_target.split_off(src.as_str());
            std::mem::replace(&mut self.pending_target, ahead)
        } else {
            BTreeMap::new()
        };
        for (_, record) in deletes {
            self.changes.delete(record);
        }
    }

    /// Choose the side(s) to advance.
    ///
    /// A live side without a frontier has only returned malformed hits so
    /// far and counts as behind. Fails with [`SyncError::Invariant`] when
    /// neither side can be shown to be behind, which sorted input never
    /// produces.
    pub fn next_direction(&self) -> Result<Direction> {
        match (self.src_exhausted, self.dst_exhausted) {
            (true, true) => return Ok(Direction::Done),
            (true, false) => return Ok(Direction::TargetOnly),
            (false, true) => return Ok(Direction::SourceOnly),
            (false, false) => {}
        }

        let src = self.last_src_id.as_deref();
        let dst = self.last_dst_id.as_deref();
        if src.is_some() && src == dst {
            return Ok(Direction::Both);
        }

        let source_behind = match (src, dst) {
            (None, _) => true,
            (Some(s), Some(d)) => s < d,
            (Some(_), None) => false,
        };
        let target_behind = match (src, dst) {
            (_, None) => true,
            (Some(s), Some(d)) => d < s,
            (None, Some(_)) => false,
        };

        match (source_behind, target_behind) {
            (true, true) => Ok(Direction::Both),
            (true, false) => Ok(Direction::SourceOnly),
            (false, true) => Ok(Direction::TargetOnly),
            (false, false) => Err(SyncError::Invariant(format!(
                "cannot choose a side to advance (last source id {:?}, last target id {:?})",
                src, dst
            ))),
        }
    }

    /// Changes accumulated since the last call.
    pub fn take_changes(&mut self) -> ChangeSet {
        let mut changes = std::mem::take(&mut self.changes);
        changes.inferred_type = self.last_src_type.clone();
        changes
    }

    /// Schedule everything still buffered: source leftovers are missing on
    /// the target, target leftovers are gone from the source.
    pub fn drain(&mut self) -> ChangeSet {
        for (_, record) in std::mem::take(&mut self.pending_source) {
            self.changes.upsert(record);
        }
        for (_, record) in std::mem::take(&mut self.pending_target) {
            self.changes.delete(record);
        }
        self.take_changes()
    }

    pub fn pending_source(&self) -> usize {
        self.pending_source.len()
    }

    pub fn pending_target(&self) -> usize {
        self.pending_target.len()
    }

    pub fn unchanged(&self) -> usize {
        self.unchanged
    }

    pub fn last_source_id(&self) -> Option<&str> {
        self.last_src_id.as_deref()
    }

    pub fn last_target_id(&self) -> Option<&str> {
        self.last_dst_id.as_deref()
    }
}

/// Reject a page that moves backwards: a wrong diff is worse than none.
fn check_ascending<'a>(side: &str, previous: Option<&'a str>, records: &'a [SourceRecord]) -> Result<()> {
    let mut prev = previous;
    for record in records {
        if let Some(p) = prev {
            if record.id.as_str() < p {
                return Err(SyncError::Invariant(format!(
                    "{} cursor out of order: {} after {}",
                    side, record.id, p
                )));
            }
        }
        prev = Some(record.id.as_str());
    }
    Ok(())
}

/// Diff two id-sorted in-memory snapshots, paging them exactly as the
/// engine pages cursors. Returns every change in emission order.
pub fn diff_sorted(source: &[SourceRecord], target: &[SourceRecord], page_size: usize) -> Result<Vec<Change>> {
    let page_size = page_size.max(1);
    let mut src_pages = source.chunks(page_size);
    let mut dst_pages = target.chunks(page_size);
    let next = |pages: &mut std::slice::Chunks<'_, SourceRecord>| {
        let page = pages.next().map(<[SourceRecord]>::to_vec).unwrap_or_default();
        let exhausted = page.len() < page_size;
        (page, exhausted)
    };

    let mut merge = MergeState::new();
    let mut emitted = Vec::new();
    let (mut need_src, mut need_dst) = (true, true);
    loop {
        if need_dst {
            let (page, exhausted) = next(&mut dst_pages);
            merge.absorb_target_page(page, exhausted)?;
        }
        if need_src {
            let (page, exhausted) = next(&mut src_pages);
            merge.absorb_source_page(page, exhausted)?;
        }
        merge.settle();
        emitted.extend(merge.take_changes().into_changes());

        (need_src, need_dst) = match merge.next_direction()? {
            Direction::Done => break,
            Direction::Both => (true, true),
            Direction::SourceOnly => (true, false),
            Direction::TargetOnly => (false, true),
        };
    }
    emitted.extend(merge.drain().into_changes());
    Ok(emitted)
}

// =============================================================================
// Engine
// =============================================================================

/// Lifecycle of one diff run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffState {
    Init,
    OpenSourceCursor,
    OpenTargetCursor,
    Iterate,
    DrainRemainder,
    CloseCursors,
    Done,
    Failed,
}

impl DiffState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffState::Init => "init",
            DiffState::OpenSourceCursor => "open_source_cursor",
            DiffState::OpenTargetCursor => "open_target_cursor",
            DiffState::Iterate => "iterate",
            DiffState::DrainRemainder => "drain_remainder",
            DiffState::CloseCursors => "close_cursors",
            DiffState::Done => "done",
            DiffState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DiffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counters for one diff run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffStats {
    /// Raw hits read from the source, skipped ones included.
    pub source_docs: usize,
    pub target_docs: usize,
    pub source_pages: usize,
    pub target_pages: usize,
    pub source_total_hits: u64,
    pub target_total_hits: u64,
    pub rounds: usize,
    pub upserts: usize,
    pub deletes: usize,
    pub unchanged: usize,
    /// Records dropped as malformed.
    pub skipped: usize,
    /// Scheduled changes not yet acknowledged by the target when the run stopped.
    pub undelivered: usize,
    /// The target cursor could not be opened and was treated as empty.
    pub target_fallback: bool,
    pub bulk: BulkStats,
}

/// A failed diff run, with the counters gathered up to the failure.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct DiffError {
    pub source: SyncError,
    pub stats: DiffStats,
}

impl From<DiffError> for SyncError {
    fn from(e: DiffError) -> Self {
        e.source
    }
}

/// Drives two cursors through a [`MergeState`] and ships each round's
/// changes through a [`BulkPipeline`].
pub struct DiffEngine {
    source: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    source_request: ScrollRequest,
    target_request: ScrollRequest,
    transform: IngestTransform,
    pipeline: BulkPipeline,
    state: DiffState,
    stats: DiffStats,
}

impl DiffEngine {
    pub fn new(
        source: Arc<dyn StoreAdapter>,
        target: Arc<dyn StoreAdapter>,
        source_request: ScrollRequest,
        target_request: ScrollRequest,
        transform: IngestTransform,
        pipeline: BulkPipeline,
    ) -> Self {
        Self {
            source,
            target,
            source_request,
            target_request,
            transform,
            pipeline,
            state: DiffState::Init,
            stats: DiffStats::default(),
        }
    }

    pub fn state(&self) -> DiffState {
        self.state
    }

    pub fn stats(&self) -> &DiffStats {
        &self.stats
    }

    fn transition(&mut self, next: DiffState) {
        debug!(from = %self.state, to = %next, "Diff state transition");
        self.state = next;
    }

    /// Run the diff to completion.
    ///
    /// A source cursor that fails to open fails the run; a target cursor
    /// that fails to open is replaced by an empty one, which turns the run
    /// into a full re-insert.
    #[instrument(skip(self), fields(source = %self.source.name(), target = %self.target.name()))]
    pub async fn run(&mut self) -> std::result::Result<DiffStats, DiffError> {
        self.transition(DiffState::OpenSourceCursor);
        let source_cursor = ScrollCursor::open(self.source.clone(), self.source_request.clone(), "source").await;
        let mut source_cursor: Box<dyn CursorSource> = match source_cursor {
            Ok(cursor) => Box::new(cursor),
            Err(e) => {
                self.transition(DiffState::CloseCursors);
                return Err(self.fail(e));
            }
        };

        self.transition(DiffState::OpenTargetCursor);
        let target_cursor = ScrollCursor::open(self.target.clone(), self.target_request.clone(), "target").await;
        let mut target_cursor: Box<dyn CursorSource> = match target_cursor {
            Ok(cursor) => Box::new(cursor),
            Err(e) => {
                warn!(
                    indices = %self.target_request.indices,
                    error = %e,
                    "Cannot scan target; treating it as empty"
                );
                metrics::record_cursor_fallback("target");
                self.stats.target_fallback = true;
                Box::new(EmptyCursor::new(self.target_request.page_size))
            }
        };
        self.stats.source_total_hits = source_cursor.total_hits();
        self.stats.target_total_hits = target_cursor.total_hits();
        info!(
            source_total = self.stats.source_total_hits,
            target_total = self.stats.target_total_hits,
            "Diff started"
        );

        let mut merge = MergeState::new();
        let result = self
            .iterate(&mut merge, source_cursor.as_mut(), target_cursor.as_mut())
            .await;

        self.transition(DiffState::CloseCursors);
        for (side, cursor) in [("source", &mut source_cursor), ("target", &mut target_cursor)] {
            if let Err(e) = cursor.close().await {
                warn!(side, error = %e, "Failed to release cursor");
            }
        }
        self.stats.unchanged = merge.unchanged();
        self.stats.bulk = self.pipeline.stats();

        match result {
            Ok(()) => {
                self.transition(DiffState::Done);
                info!(
                    source_docs = self.stats.source_docs,
                    target_docs = self.stats.target_docs,
                    upserts = self.stats.upserts,
                    deletes = self.stats.deletes,
                    unchanged = self.stats.unchanged,
                    skipped = self.stats.skipped,
                    "Diff complete"
                );
                Ok(self.stats.clone())
            }
            Err(e) => {
                self.stats.undelivered += merge.pending_source() + merge.pending_target();
                Err(self.fail(e))
            }
        }
    }

    fn fail(&mut self, error: SyncError) -> DiffError {
        self.transition(DiffState::Failed);
        warn!(
            error = %error,
            source_docs = self.stats.source_docs,
            target_docs = self.stats.target_docs,
            undelivered = self.stats.undelivered,
            "Diff failed"
        );
        DiffError {
            source: error,
            stats: self.stats.clone(),
        }
    }

    async fn iterate(
        &mut self,
        merge: &mut MergeState,
        source: &mut dyn CursorSource,
        target: &mut dyn CursorSource,
    ) -> Result<()> {
        self.transition(DiffState::Iterate);
        let src_page_size = self.source_request.page_size;
        let dst_page_size = self.target_request.page_size;
        let (mut need_src, mut need_dst) = (true, true);

        loop {
            self.stats.rounds += 1;
            if need_dst {
                let page = target.next_page().await?;
                let exhausted = page.is_exhausted(dst_page_size);
                self.count_page("target", &page);
                merge.absorb_target_page(page.records, exhausted)?;
            }
            if need_src {
                let page = source.next_page().await?;
                let exhausted = page.is_exhausted(src_page_size);
                self.count_page("source", &page);
                merge.absorb_source_page(page.records, exhausted)?;
            }

            merge.settle();
            metrics::set_pending_buffers(merge.pending_source(), merge.pending_target());
            self.emit(merge.take_changes()).await?;

            let direction = merge.next_direction()?;
            debug!(
                round = self.stats.rounds,
                last_source = ?merge.last_source_id(),
                last_target = ?merge.last_target_id(),
                pending_source = merge.pending_source(),
                pending_target = merge.pending_target(),
                ?direction,
                "Round complete"
            );
            (need_src, need_dst) = match direction {
                Direction::Done => break,
                Direction::Both => (true, true),
                Direction::SourceOnly => (true, false),
                Direction::TargetOnly => (false, true),
            };
        }

        self.transition(DiffState::DrainRemainder);
        let remainder = merge.drain();
        self.emit(remainder).await
    }

    fn count_page(&mut self, side: &str, page: &RecordPage) {
        self.stats.skipped += page.skipped;
        if side == "source" {
            self.stats.source_docs += page.fetched;
            self.stats.source_pages += 1;
        } else {
            self.stats.target_docs += page.fetched;
            self.stats.target_pages += 1;
        }
    }

    /// Submit one round's changes and flush them.
    async fn emit(&mut self, changes: ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let upserts = changes.upserts();
        let deletes = changes.deletes();
        self.stats.upserts += upserts;
        self.stats.deletes += deletes;
        metrics::record_changes(upserts, deletes);

        let inferred_type = changes.inferred_type().map(str::to_string);
        let mut remaining = changes.len();
        for change in changes.into_changes() {
            let op = match change.into_op(&self.transform, inferred_type.as_deref()) {
                Ok(op) => op,
                Err(SyncError::DataShape(reason)) => {
                    warn!(reason = %reason, "Skipping change with no destination");
                    self.stats.skipped += 1;
                    remaining -= 1;
                    continue;
                }
                Err(e) => {
                    self.stats.undelivered = remaining + self.pipeline.buffered_items();
                    return Err(e);
                }
            };
            if let Err(e) = self.pipeline.submit(op).await {
                self.stats.undelivered = remaining + self.pipeline.buffered_items();
                return Err(e);
            }
            remaining -= 1;
        }

        if let Err(e) = self.pipeline.flush_retrying().await {
            self.stats.undelivered = self.pipeline.buffered_items();
            return Err(e);
        }
        Ok(())
    }
}
