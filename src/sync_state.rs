//! Full vs. incremental sync decision.

use crate::store::{EntityStore, RowFilter, StoreResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// How much of the input set a run has to revisit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Revisit every input
    Full,
    /// Revisit inputs updated after the watermark
    Incremental,
}

/// Result of [`SyncStateResolver::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncState {
    /// Selected mode
    pub mode: SyncMode,
    /// Watermark; always `None` in full mode
    pub since: Option<DateTime<Utc>>,
}

impl SyncState {
    /// A full sync
    pub fn full() -> Self {
        Self {
            mode: SyncMode::Full,
            since: None,
        }
    }

    /// Whether the run is incremental
    pub fn is_incremental(&self) -> bool {
        self.mode == SyncMode::Incremental
    }

    /// Cursor bound combining the watermark with an optional time-range floor.
    ///
    /// The later of the two wins; either may be absent.
    pub fn updated_after(&self, time_after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match (self.since, time_after) {
            (Some(since), Some(after)) => Some(since.max(after)),
            (since, after) => since.or(after),
        }
    }

    /// Row filter for cursoring over the driving entities of `params`.
    pub fn input_filter(&self, params: &str, time_after: Option<DateTime<Utc>>) -> RowFilter {
        RowFilter::for_params(params).updated_after(self.updated_after(time_after))
    }
}

/// Derives [`SyncState`] from the rows a previous run produced.
///
/// Nothing is persisted: the watermark is recomputed from the product table on
/// every call.
#[derive(Clone)]
pub struct SyncStateResolver {
    store: Arc<dyn EntityStore>,
    product_table: String,
    allow_incremental: bool,
}

impl SyncStateResolver {
    /// Resolve against `product_table`, whose rows carry the "updated" timestamps.
    pub fn new(
        store: Arc<dyn EntityStore>,
        product_table: impl Into<String>,
        allow_incremental: bool,
    ) -> Self {
        Self {
            store,
            product_table: product_table.into(),
            allow_incremental,
        }
    }

    /// Decide the sync mode for `params`.
    pub async fn resolve(&self, params: &str) -> StoreResult<SyncState> {
        if !self.allow_incremental {
            info!(table = %self.product_table, "Incremental sync disabled, running full sync");
            return Ok(SyncState::full());
        }

        let prior_rows = self.store.count(&self.product_table, params).await?;
        if prior_rows == 0 {
            info!(table = %self.product_table, "No prior product rows, running full sync");
            return Ok(SyncState::full());
        }

        let since = self.store.max_updated_at(&self.product_table, params).await?;
        info!(
            table = %self.product_table,
            prior_rows,
            since = ?since,
            "Running incremental sync"
        );
        Ok(SyncState {
            mode: SyncMode::Incremental,
            since,
        })
    }
}
