//! Lazy, restartable input sequences read back from entity tables.
//!
//! A [`CursorIterator`] pages through rows matching a [`RowFilter`] in
//! ascending primary key order using keyset pagination: each batch asks the
//! store for rows with `id > last seen id`, so memory stays bounded by the
//! batch size and a fresh iterator over the same filter yields the same
//! sequence.

use crate::collector::config::DEFAULT_CURSOR_BATCH;
use crate::store::{EntityRow, EntityStore, RowFilter, StoreError, StoreResult};
use futures_util::stream::{self, Stream};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Input items handed to a collector.
///
/// A row that cannot be decoded surfaces as [`StoreError::RowDecode`] and the
/// sequence continues; any other error ends it.
pub type InputStream<T> = Pin<Box<dyn Stream<Item = StoreResult<T>> + Send>>;

/// Typed cursor over one entity table.
pub struct CursorIterator<T> {
    store: Arc<dyn EntityStore>,
    table: String,
    filter: RowFilter,
    batch_size: usize,
    last_id: Option<i64>,
    buffer: VecDeque<EntityRow>,
    exhausted: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T> CursorIterator<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Open a cursor over `table` restricted by `filter`.
    pub fn new(store: Arc<dyn EntityStore>, table: impl Into<String>, filter: RowFilter) -> Self {
        Self {
            store,
            table: table.into(),
            filter,
            batch_size: DEFAULT_CURSOR_BATCH,
            last_id: None,
            buffer: VecDeque::new(),
            exhausted: false,
            _item: PhantomData,
        }
    }

    /// Set the number of rows fetched per store round trip (minimum 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Filter this cursor reads with
    pub fn filter(&self) -> &RowFilter {
        &self.filter
    }

    /// Next item, or `Ok(None)` at end of sequence.
    pub async fn next(&mut self) -> StoreResult<Option<T>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        let Some(row) = self.buffer.pop_front() else {
            return Ok(None);
        };
        self.last_id = Some(row.id);
        serde_json::from_value(row.data).map(Some).map_err(|e| StoreError::RowDecode {
            table: self.table.clone(),
            id: row.id,
            message: e.to_string(),
        })
    }

    /// Rewind to the start of the sequence.
    pub fn restart(&mut self) {
        self.last_id = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    /// Convert into a stream for the collector.
    pub fn into_stream(self) -> InputStream<T> {
        Box::pin(stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(cursor))),
                Ok(None) => None,
                Err(e @ StoreError::RowDecode { .. }) => Some((Err(e), Some(cursor))),
                Err(e) => Some((Err(e), None)),
            }
        }))
    }

    async fn fill(&mut self) -> StoreResult<()> {
        let after = self.last_id;
        let rows = self
            .store
            .scan(&self.table, &self.filter, after, self.batch_size)
            .await?;
        debug!(
            table = %self.table,
            after = ?after,
            fetched = rows.len(),
            "Cursor batch loaded"
        );
        if rows.len() < self.batch_size {
            self.exhausted = true;
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

/// A one-element input sequence for endpoints that take no driving entity.
pub fn single_input<T: Send + 'static>(item: T) -> InputStream<T> {
    Box::pin(stream::once(async move { Ok(item) }))
}

/// Input sequence over items already in memory.
pub fn inputs_from<T: Send + 'static>(items: Vec<T>) -> InputStream<T> {
    Box::pin(stream::iter(items.into_iter().map(Ok)))
}
