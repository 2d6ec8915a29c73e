// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry backoff and write throttling.
//!
//! - [`RetryConfig`]: Exponential backoff for failed bulk flushes, applied
//!   by the coordinator (never inside `flush()` itself)
//! - [`RateLimiter`]: Token bucket capping documents per second per worker
//!
//! # Delete Policy
//!
//! Re-sending an upsert is always safe: the target keys documents by id and
//! the last write wins. Re-sending a delete is also idempotent at the store,
//! but a delete replayed after a later upsert of the same id would remove a
//! live document. Batches containing deletes are therefore only retried when
//! [`RetryConfig::retry_deletes`] is set.
//!
//! Item-level failures inside an accepted bulk request are counted, not
//! retried. The exception is a batch whose only failures are 429s: the HTTP
//! adapter reports it as a `BulkWrite` 429, which this policy retries like
//! any other throttled request.

use crate::error::SyncError;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Backoff schedule for retrying a failed flush.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts (1 = no retry).
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Whether batches carrying deletes may be re-sent.
    pub retry_deletes: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            retry_deletes: false,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            retry_deletes: false,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }

    /// Decide whether a failed flush should be attempted again.
    ///
    /// `attempt` is the number of attempts already made.
    pub fn should_retry(&self, error: &SyncError, attempt: usize, has_deletes: bool) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if has_deletes && !self.retry_deletes {
            return false;
        }
        error.is_retryable()
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket limiting documents submitted per second.
///
/// Tokens refill at `per_second`, with a burst equal to one second's worth.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    per_second: u32,
}

impl RateLimiter {
    /// Create a limiter admitting `per_second` documents per second.
    pub fn per_second(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let limiter = GovLimiter::direct(Quota::per_second(rate));
        Self {
            limiter,
            per_second: rate.get(),
        }
    }

    /// Wait for one permit.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Configured sustained rate.
    pub fn rate(&self) -> u32 {
        self.per_second
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.per_second)
            .finish()
    }
}
