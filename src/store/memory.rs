//! In-memory store used by tests and dry runs.

use super::{
    EntityRow, EntityStore, RawDataRecord, RawDataStore, RawKey, RawRecordStream, RowFilter,
    StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

type RawTable = BTreeMap<RawKey, RawDataRecord>;
/// Rows keyed by `(params, id)`; one params' rows are contiguous in id order.
type EntityTable = BTreeMap<(String, i64), EntityRow>;

#[derive(Default)]
struct Tables {
    raw: RwLock<HashMap<String, RawTable>>,
    entities: RwLock<HashMap<String, EntityTable>>,
}

/// Process-local implementation of [`RawDataStore`] and [`EntityStore`].
///
/// Cloning is cheap and clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Tables>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::LockError("memory store lock poisoned".to_string())
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw records in `table`, across all params
    pub fn raw_record_count(&self, table: &str) -> usize {
        self.tables
            .raw
            .read()
            .map(|raw| raw.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Look up a single raw record
    pub fn raw_record(&self, table: &str, key: &RawKey) -> Option<RawDataRecord> {
        self.tables
            .raw
            .read()
            .ok()
            .and_then(|raw| raw.get(table).and_then(|t| t.get(key).cloned()))
    }

    fn next_raw_after(
        &self,
        table: &str,
        params: &str,
        after: Option<&RawKey>,
    ) -> StoreResult<Option<RawDataRecord>> {
        let raw = self.tables.raw.read().map_err(poisoned)?;
        let Some(records) = raw.get(table) else {
            return Ok(None);
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Included(RawKey::new(params, "", 0)),
        };
        Ok(records
            .range((lower, Bound::Unbounded))
            .map(|(_, record)| record)
            .take_while(|record| record.params == params)
            .next()
            .cloned())
    }
}

#[async_trait]
impl RawDataStore for MemoryStore {
    async fn upsert(&self, table: &str, record: RawDataRecord) -> StoreResult<()> {
        let mut raw = self.tables.raw.write().map_err(poisoned)?;
        raw.entry(table.to_string())
            .or_default()
            .insert(record.key(), record);
        Ok(())
    }

    async fn iterate(&self, table: &str, params: &str) -> StoreResult<RawRecordStream> {
        let store = self.clone();
        let table = table.to_string();
        let params = params.to_string();

        // Keyset walk: each step re-enters the lock and reads the next record only.
        let records = stream::unfold(Some(None::<RawKey>), move |cursor| {
            let store = store.clone();
            let table = table.clone();
            let params = params.clone();
            async move {
                let after = cursor?;
                match store.next_raw_after(&table, &params, after.as_ref()) {
                    Ok(Some(record)) => {
                        let key = record.key();
                        Some((Ok(record), Some(Some(key))))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(e), None)),
                }
            }
        });

        Ok(Box::pin(records))
    }

    async fn retain_pages(
        &self,
        table: &str,
        params: &str,
        input: &str,
        pages: u32,
    ) -> StoreResult<u64> {
        let mut raw = self.tables.raw.write().map_err(poisoned)?;
        let Some(records) = raw.get_mut(table) else {
            return Ok(0);
        };
        let stale: Vec<RawKey> = records
            .range(RawKey::new(params, input, pages.saturating_add(1))..)
            .map(|(key, _)| key)
            .take_while(|key| key.params == params && key.input == input)
            .cloned()
            .collect();
        for key in &stale {
            records.remove(key);
        }
        Ok(stale.len() as u64)
    }

    async fn has_data(&self, table: &str, params: &str) -> StoreResult<bool> {
        Ok(self.next_raw_after(table, params, None)?.is_some())
    }
}

/// Every row of one params, ascending by id.
fn rows_of<'a>(rows: &'a EntityTable, params: &str) -> impl Iterator<Item = &'a EntityRow> + 'a {
    rows.range((params.to_string(), i64::MIN)..=(params.to_string(), i64::MAX))
        .map(|(_, row)| row)
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn upsert_rows(&self, table: &str, rows: Vec<EntityRow>) -> StoreResult<()> {
        let mut entities = self.tables.entities.write().map_err(poisoned)?;
        let rows_by_key = entities.entry(table.to_string()).or_default();
        for row in rows {
            rows_by_key.insert((row.params.clone(), row.id), row);
        }
        Ok(())
    }

    async fn scan(
        &self,
        table: &str,
        filter: &RowFilter,
        after: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<EntityRow>> {
        let entities = self.tables.entities.read().map_err(poisoned)?;
        let Some(rows) = entities.get(table) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(after) => Bound::Excluded((filter.params.clone(), after)),
            None => Bound::Included((filter.params.clone(), i64::MIN)),
        };
        let upper = Bound::Included((filter.params.clone(), i64::MAX));
        Ok(rows
            .range((lower, upper))
            .map(|(_, row)| row)
            .filter(|row| filter.matches(row))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn max_updated_at(
        &self,
        table: &str,
        params: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let entities = self.tables.entities.read().map_err(poisoned)?;
        Ok(entities.get(table).and_then(|rows| {
            rows_of(rows, params).filter_map(|row| row.updated_at).max()
        }))
    }

    async fn count(&self, table: &str, params: &str) -> StoreResult<u64> {
        let entities = self.tables.entities.read().map_err(poisoned)?;
        Ok(entities
            .get(table)
            .map_or(0, |rows| rows_of(rows, params).count() as u64))
    }
}
