//! Persistence for raw payloads and the entity tables that drive collection.
//!
//! Two seams live here:
//!
//! - [`RawDataStore`] holds unprocessed upstream pages keyed by
//!   `(table, params, input identity, page ordinal)`. An upsert for an existing
//!   key replaces the previous record, which is what makes re-collection
//!   idempotent.
//! - [`EntityStore`] holds typed rows (parent entities, extracted products) that
//!   the cursor iterator and the sync state resolver read back.
//!
//! Both traits are implemented by [`memory::MemoryStore`] and
//! [`file::FileStore`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Persistence errors. Every variant is fatal for the stage that hits it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem or device error
    #[error("IO error: {0}")]
    IoError(String),

    /// A stored record could not be encoded or decoded
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Lock acquisition failed
    #[error("lock error: {0}")]
    LockError(String),

    /// A row's payload did not match the type requested by the caller
    #[error("row {id} in {table} could not be decoded: {message}")]
    RowDecode {
        /// Table the row came from
        table: String,
        /// Primary key of the row
        id: i64,
        /// Decoder message
        message: String,
    },

    /// The backing store is not reachable
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Identity of one raw record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawKey {
    /// Canonical params string (connection + entity selector)
    pub params: String,
    /// Identity of the input item that drove the fetch
    pub input: String,
    /// 1-based page ordinal within the input item
    pub page: u32,
}

impl RawKey {
    /// Build a key from its parts
    pub fn new(params: impl Into<String>, input: impl Into<String>, page: u32) -> Self {
        Self {
            params: params.into(),
            input: input.into(),
            page,
        }
    }
}

/// One persisted upstream page.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDataRecord {
    /// Canonical params string
    pub params: String,
    /// Input identity (same string as [`RawKey::input`])
    pub input_id: String,
    /// Serialized input item, kept so extractors can see what drove the fetch
    pub input: serde_json::Value,
    /// Page ordinal
    pub page: u32,
    /// URL the page was fetched from
    pub url: String,
    /// Raw payload bytes
    pub data: Bytes,
    /// When this version of the record was written
    pub created_at: DateTime<Utc>,
}

impl RawDataRecord {
    /// Key this record is stored under
    pub fn key(&self) -> RawKey {
        RawKey::new(self.params.clone(), self.input_id.clone(), self.page)
    }
}

/// Lazy sequence of raw records, ordered by `(input identity, page)`.
pub type RawRecordStream = Pin<Box<dyn Stream<Item = StoreResult<RawDataRecord>> + Send>>;

/// Keyed, idempotent persistence of fetched pages.
#[async_trait]
pub trait RawDataStore: Send + Sync {
    /// Insert or replace the record stored under `record.key()`.
    async fn upsert(&self, table: &str, record: RawDataRecord) -> StoreResult<()>;

    /// Stream every record of `table` whose params equal `params`.
    async fn iterate(&self, table: &str, params: &str) -> StoreResult<RawRecordStream>;

    /// Drop pages of one input whose ordinal is greater than `pages`.
    ///
    /// Returns the number of records removed.
    async fn retain_pages(
        &self,
        table: &str,
        params: &str,
        input: &str,
        pages: u32,
    ) -> StoreResult<u64>;

    /// Whether `table` holds at least one record for `params`.
    async fn has_data(&self, table: &str, params: &str) -> StoreResult<bool>;
}

/// A typed row of an entity table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    /// Primary key within its params; cursor order follows it
    pub id: i64,
    /// Canonical params string the row belongs to
    pub params: String,
    /// Upstream "updated" timestamp, when the entity has one
    pub updated_at: Option<DateTime<Utc>>,
    /// Row payload
    pub data: serde_json::Value,
}

/// Predicate over entity rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    /// Rows must belong to these params
    pub params: String,
    /// When set, rows must have `updated_at` strictly after this instant
    pub updated_after: Option<DateTime<Utc>>,
}

impl RowFilter {
    /// Match every row of `params`
    pub fn for_params(params: impl Into<String>) -> Self {
        Self {
            params: params.into(),
            updated_after: None,
        }
    }

    /// Restrict to rows updated strictly after `since`
    pub fn updated_after(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.updated_after = since;
        self
    }

    /// Evaluate the predicate
    pub fn matches(&self, row: &EntityRow) -> bool {
        if row.params != self.params {
            return false;
        }
        match (self.updated_after, row.updated_at) {
            (None, _) => true,
            (Some(since), Some(updated)) => updated > since,
            // An undated row cannot be shown to be newer than the watermark.
            (Some(_), None) => false,
        }
    }
}

/// Read/write access to entity tables.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert or replace rows by `(params, id)`; rows of different params never
    /// replace each other.
    async fn upsert_rows(&self, table: &str, rows: Vec<EntityRow>) -> StoreResult<()>;

    /// Return up to `limit` rows matching `filter` with `id > after`, in
    /// ascending primary key order.
    async fn scan(
        &self,
        table: &str,
        filter: &RowFilter,
        after: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<EntityRow>>;

    /// Latest `updated_at` among rows of `params`.
    async fn max_updated_at(&self, table: &str, params: &str)
        -> StoreResult<Option<DateTime<Utc>>>;

    /// Number of rows of `params`.
    async fn count(&self, table: &str, params: &str) -> StoreResult<u64>;
}
