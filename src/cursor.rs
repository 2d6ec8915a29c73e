// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Paginated scan handles over one side's document stream.
//!
//! A cursor wraps a server-side scroll: `open` issues the initial search,
//! `next_page` continues it with the stored token, and `close` releases it.
//! Each page is decoded into [`SourceRecord`]s; a malformed hit is logged,
//! counted and skipped without failing the page.
//!
//! # Cursor Semantics
//!
//! - Pages arrive in ascending sort order within one snapshot.
//! - A page with fewer raw hits than `page_size` means the stream is
//!   exhausted. Skipped hits still count toward the page length.
//! - `close` is idempotent; closing an already-released scroll is not an
//!   error.
//!
//! ```text
//! open ──▶ [page 1 buffered] ──▶ next_page ──▶ next_page ... ──▶ close
//! ```

use crate::document::SourceRecord;
use crate::error::Result;
use crate::metrics;
use crate::store::{BoxFuture, ScrollPage, ScrollRequest, StoreAdapter};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Progress of one cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorState {
    /// Continuation token for the server-side snapshot.
    pub scroll_token: Option<String>,
    pub page_size: usize,
    pub total_hits: u64,
    /// Id of the last valid record handed out.
    pub last_seen_id: Option<String>,
}

/// One decoded page.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<SourceRecord>,
    /// Raw hits received, including skipped ones.
    pub fetched: usize,
    pub skipped: usize,
}

impl RecordPage {
    /// Whether this page ended the stream.
    pub fn is_exhausted(&self, page_size: usize) -> bool {
        self.fetched < page_size
    }

    /// Id of the last record on the page.
    pub fn last_id(&self) -> Option<&str> {
        self.records.last().map(|r| r.id.as_str())
    }
}

/// A paginated scan over one side.
///
/// Object-safe so the diff engine can hold either a live scroll or the
/// empty fallback behind `Box<dyn CursorSource>`.
pub trait CursorSource: Send {
    /// Fetch and decode the next page.
    fn next_page(&mut self) -> BoxFuture<'_, RecordPage>;

    fn total_hits(&self) -> u64;

    fn state(&self) -> &CursorState;

    /// Release the server-side snapshot. Safe to call more than once.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

// =============================================================================
// ScrollCursor
// =============================================================================

/// Cursor backed by a store scroll.
pub struct ScrollCursor {
    store: Arc<dyn StoreAdapter>,
    request: ScrollRequest,
    side: &'static str,
    state: CursorState,
    /// First page, returned by `open` and handed out by the first `next_page`.
    first_page: Option<ScrollPage>,
    pages_fetched: usize,
    closed: bool,
}

impl ScrollCursor {
    /// Open a scroll. The first page is fetched here and buffered.
    pub async fn open(store: Arc<dyn StoreAdapter>, request: ScrollRequest, side: &'static str) -> Result<Self> {
        let start = Instant::now();
        let page = store.open_scroll(&request).await?;
        metrics::record_page_fetch(side, start.elapsed());

        debug!(
            side,
            store = %store.name(),
            indices = %request.indices,
            total_hits = page.total_hits,
            page_size = request.page_size,
            "Cursor opened"
        );

        let state = CursorState {
            scroll_token: page.scroll_id.clone(),
            page_size: request.page_size,
            total_hits: page.total_hits,
            last_seen_id: None,
        };
        Ok(Self {
            store,
            request,
            side,
            state,
            first_page: Some(page),
            pages_fetched: 0,
            closed: false,
        })
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    fn decode(&mut self, page: ScrollPage) -> RecordPage {
        if page.scroll_id.is_some() {
            self.state.scroll_token = page.scroll_id;
        }
        let fetched = page.hits.len();
        let mut records = Vec::with_capacity(fetched);
        let mut skipped = 0;

        for hit in page.hits {
            match SourceRecord::from_hit(hit) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(side = self.side, error = %e, "Skipping malformed record");
                    metrics::record_record_skipped(self.side);
                    skipped += 1;
                }
            }
        }

        if let Some(last) = records.last() {
            self.state.last_seen_id = Some(last.id.clone());
        }
        self.pages_fetched += 1;
        metrics::record_docs_scanned(self.side, fetched);

        RecordPage {
            records,
            fetched,
            skipped,
        }
    }
}

impl CursorSource for ScrollCursor {
    fn next_page(&mut self) -> BoxFuture<'_, RecordPage> {
        Box::pin(async move {
            if self.closed {
                return Ok(RecordPage::default());
            }
            if let Some(page) = self.first_page.take() {
                return Ok(self.decode(page));
            }
            let token = match self.state.scroll_token.clone() {
                Some(token) => token,
                None => return Ok(RecordPage::default()),
            };

            let start = Instant::now();
            let page = self.store.next_scroll(&self.request.scroll_time, &token).await?;
            metrics::record_page_fetch(self.side, start.elapsed());
            Ok(self.decode(page))
        })
    }

    fn total_hits(&self) -> u64 {
        self.state.total_hits
    }

    fn state(&self) -> &CursorState {
        &self.state
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            self.first_page = None;
            if let Some(token) = self.state.scroll_token.take() {
                self.store.clear_scroll(&token).await?;
                debug!(side = self.side, pages = self.pages_fetched, "Cursor closed");
            }
            Ok(())
        })
    }
}

// =============================================================================
// EmptyCursor
// =============================================================================

/// Cursor over nothing. Stands in for a target index that could not be
/// scanned, which turns the run into a full re-insert.
#[derive(Debug, Default)]
pub struct EmptyCursor {
    state: CursorState,
}

impl EmptyCursor {
    pub fn new(page_size: usize) -> Self {
        Self {
            state: CursorState {
                page_size,
                ..CursorState::default()
            },
        }
    }
}

impl CursorSource for EmptyCursor {
    fn next_page(&mut self) -> BoxFuture<'_, RecordPage> {
        Box::pin(async { Ok(RecordPage::default()) })
    }

    fn total_hits(&self) -> u64 {
        0
    }

    fn state(&self) -> &CursorState {
        &self.state
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
