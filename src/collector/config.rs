//! Collector configuration constants and runtime settings

use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;
use std::sync::Arc;

/// Default number of retries for a retryable page fetch.
/// Three retries (four attempts) ride out short upstream blips without
/// stretching a single page past a minute of backoff.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound accepted for `--max-retries`.
pub const MAX_RETRIES_LIMIT: u32 = 20;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds, also the cap on `Retry-After`.
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Default number of input items fetched concurrently.
pub const DEFAULT_WORKERS: usize = 4;

/// Hard ceiling on concurrent items per collector.
/// Upstream APIs rate limit per token, so more workers only queue on the limiter.
pub const MAX_WORKERS: usize = 32;

/// Default page size requested from the upstream API.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Pages fetched for one item before it is abandoned.
/// Guards against upstreams that keep handing out cursors forever.
pub const MAX_PAGES_PER_ITEM: u32 = 10_000;

/// Bytes of a response body kept for logs and skip reasons.
pub const BODY_LOG_LIMIT: usize = 300;

/// Rows read per entity store round trip by a cursor.
pub const DEFAULT_CURSOR_BATCH: usize = 500;

/// Runtime knobs for one collector run.
#[derive(Clone)]
pub struct CollectorSettings {
    /// Input items fetched concurrently (1..=MAX_WORKERS)
    pub workers: usize,
    /// Requested page size
    pub page_size: u32,
    /// Page cap per item
    pub max_pages: u32,
    /// Retry budget and backoff
    pub retry: RetryPolicy,
    /// Shared request limiter, if the upstream needs one
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Fraction of skipped items above which a stage fails
    pub max_skip_ratio: Option<f64>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: MAX_PAGES_PER_ITEM,
            retry: RetryPolicy::default(),
            rate_limiter: None,
            max_skip_ratio: None,
        }
    }
}

impl CollectorSettings {
    /// Set the worker count, clamped to `1..=MAX_WORKERS`.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }

    /// Set the page size (minimum 1).
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set the per-item page cap (minimum 1).
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share a rate limiter across every worker.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Fail stages whose skip ratio exceeds `ratio`.
    pub fn with_max_skip_ratio(mut self, ratio: f64) -> Self {
        self.max_skip_ratio = Some(ratio.clamp(0.0, 1.0));
        self
    }
}

impl std::fmt::Debug for CollectorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorSettings")
            .field("workers", &self.workers)
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("retry", &self.retry)
            .field("rate_limited", &self.rate_limiter.is_some())
            .field("max_skip_ratio", &self.max_skip_ratio)
            .finish()
    }
}
