//! Stateful API collector
//!
//! Binds an input sequence, a URL template, a pager, and a
//! [`CollectionStrategy`] into a bounded-concurrency fetch loop that persists
//! every parsed page to a [`RawDataStore`](crate::store::RawDataStore).
//!
//! Failures are contained per input item: a 404, an exhausted retry budget,
//! or a hook decision removes one item from the run and is reported as an
//! [`ItemFailure`]. Only persistence failures, fatal client errors, and
//! explicit `AbortAll` decisions end the whole collection.

pub mod client;
pub mod config;
pub mod executor;
pub mod pager;
pub mod rate_limit;
pub mod retry;
pub mod strategy;
pub mod template;

pub use client::{ApiClient, ApiResponse, HttpApiClient, TransportError};
pub use config::CollectorSettings;
pub use executor::StatefulApiCollector;
pub use pager::{PageHint, Pager};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use retry::{RetryErrorType, RetryPolicy};
pub use strategy::{
    CollectionStrategy, CollectorInput, Disposition, FetchAttemptResult, ParseError, ParsedPage,
    RequestData, StatusClass,
};
pub use template::{TemplateError, UrlTemplate};

use crate::store::StoreError;
use serde::Serialize;
use std::fmt;

/// Errors that end a collection.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// The URL template is invalid or could not be rendered
    #[error("url template error: {0}")]
    Template(#[from] TemplateError),

    /// Writing to the raw store failed
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// The input sequence failed (other than an undecodable row)
    #[error("input sequence failed: {0}")]
    Input(StoreError),

    /// An item outcome was classified `AbortAll`
    #[error("collection aborted by item {item} ({kind}): {reason}")]
    Aborted {
        /// Item that triggered the abort
        item: ItemRef,
        /// Failure classification
        kind: FailureKind,
        /// Human readable reason
        reason: String,
    },

    /// The shared rate limiter was closed
    #[error("rate limiter error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// The HTTP client could not be set up
    #[error("transport setup error: {0}")]
    Transport(#[from] TransportError),

    /// An input item could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Identity of a skipped item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemRef {
    /// A known input identity
    Item(String),
    /// The failure could not be tied to a specific input
    Unattributable,
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item(id) => f.write_str(id),
            Self::Unattributable => f.write_str("<unattributable>"),
        }
    }
}

/// Why an item failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// 404: the upstream resource no longer exists
    NotFound,
    /// Non-retryable status other than 404
    ClientError {
        /// HTTP status
        status: u16,
    },
    /// A retryable failure outlived the retry budget
    RetryExhausted {
        /// Attempts made, including the first
        attempts: u32,
        /// Classification of the final attempt
        last: RetryErrorType,
    },
    /// A 2xx body could not be parsed
    ParseError,
    /// The item hit the per-item page cap
    PageCapExceeded {
        /// The cap
        pages: u32,
    },
    /// The input row could not be decoded into the input type
    UndecodableInput,
    /// `classify_response` skipped a successful page
    SkippedByHook,
    /// `classify_response` aborted the collection on a successful page
    AbortedByHook,
}

impl FailureKind {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ClientError { .. } => "client_error",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::ParseError => "parse_error",
            Self::PageCapExceeded { .. } => "page_cap",
            Self::UndecodableInput => "undecodable_input",
            Self::SkippedByHook => "skipped_by_hook",
            Self::AbortedByHook => "aborted_by_hook",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::ClientError { status } => write!(f, "client error {status}"),
            Self::RetryExhausted { attempts, last } => {
                write!(f, "retries exhausted after {attempts} attempts ({last})")
            }
            Self::ParseError => f.write_str("unparseable response"),
            Self::PageCapExceeded { pages } => write!(f, "more than {pages} pages"),
            Self::UndecodableInput => f.write_str("undecodable input"),
            Self::SkippedByHook => f.write_str("skipped by response hook"),
            Self::AbortedByHook => f.write_str("aborted by response hook"),
        }
    }
}

/// One isolated item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    /// Which item
    pub item: ItemRef,
    /// Classification
    pub kind: FailureKind,
    /// Reason with enough context (endpoint, status, body) to diagnose
    pub reason: String,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.item, self.reason)
    }
}

/// How a collection ended.
#[derive(Debug)]
pub enum CollectionOutcome {
    /// Every dispatched item finished (some may be skipped)
    Completed,
    /// Cancellation stopped the run early
    Cancelled,
    /// A fatal error ended the run
    Failed(CollectorError),
}

/// Aggregate result of one collection.
#[derive(Debug)]
pub struct CollectionSummary {
    /// Raw table written
    pub table: String,
    /// Items processed (including items stopped by `AbortItem`)
    pub processed: u64,
    /// Items excluded by failure isolation
    pub skipped: Vec<ItemFailure>,
    /// Pages written
    pub pages_persisted: u64,
    /// HTTP requests issued
    pub requests: u64,
    /// Retries among those requests
    pub retries: u64,
    /// Final outcome
    pub outcome: CollectionOutcome,
}

impl CollectionSummary {
    /// Empty summary for `table`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            processed: 0,
            skipped: Vec::new(),
            pages_persisted: 0,
            requests: 0,
            retries: 0,
            outcome: CollectionOutcome::Completed,
        }
    }

    /// Whether the run finished without a fatal error or cancellation
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, CollectionOutcome::Completed)
    }

    /// Whether the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, CollectionOutcome::Cancelled)
    }

    /// Skipped items over all items that reached a verdict
    pub fn skip_ratio(&self) -> f64 {
        let total = self.processed + self.skipped.len() as u64;
        if total == 0 {
            0.0
        } else {
            self.skipped.len() as f64 / total as f64
        }
    }

    /// Whether any data was left behind
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty() || !self.is_completed()
    }

    /// One-line completion message
    pub fn message(&self) -> String {
        let mut message = format!(
            "processed {} items, skipped {}, {} pages persisted, {} requests ({} retries)",
            self.processed,
            self.skipped.len(),
            self.pages_persisted,
            self.requests,
            self.retries
        );
        if self.is_partial() {
            message.push_str(" [partial]");
        }
        message
    }

    /// Fatal error, if the run failed
    pub fn error(&self) -> Option<&CollectorError> {
        match &self.outcome {
            CollectionOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}
