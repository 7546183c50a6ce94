//! Directory-backed store.
//!
//! Layout under the root directory:
//!
//! ```text
//! raw/<table>/<sha256 of params>/<sha256 of input>/<page>.page
//!                                       header line (JSON) + '\n' + payload bytes
//! raw/<table>/<sha256 of params>/<sha256 of input>/.lock
//!                                       fd-lock guarding retention against writers of that input
//! entities/<table>/<sha256 of params>/<ordered id>.json
//!                                       one EntityRow per file
//! ```
//!
//! Each input owns its own directory, so writers of distinct inputs never
//! share a lock and retention only lists the pages of one input.
//!
//! Every file is written to a temp file in the same directory, synced, and
//! renamed over the target so a crash never leaves a torn record behind.

use super::{
    EntityRow, EntityStore, RawDataRecord, RawDataStore, RawRecordStream, RowFilter, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RAW_DIR: &str = "raw";
const ENTITY_DIR: &str = "entities";
const PAGE_EXT: &str = "page";
const ROW_EXT: &str = "json";
const LOCK_FILE: &str = ".lock";

/// Header line written in front of every raw payload.
#[derive(Debug, Serialize, Deserialize)]
struct RawHeader {
    params: String,
    input_id: String,
    input: serde_json::Value,
    page: u32,
    url: String,
    created_at: DateTime<Utc>,
}

/// Filesystem implementation of [`RawDataStore`] and [`EntityStore`].
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(RAW_DIR)).map_err(io_err)?;
        std::fs::create_dir_all(root.join(ENTITY_DIR)).map_err(io_err)?;
        debug!(root = %root.display(), "Opened file store");
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every input of `params` in a raw table
    fn raw_params_dir(&self, table: &str, params: &str) -> StoreResult<PathBuf> {
        Ok(self
            .root
            .join(RAW_DIR)
            .join(checked_table(table)?)
            .join(digest(params)))
    }

    /// Directory holding the pages of one input
    fn raw_input_dir(&self, table: &str, params: &str, input: &str) -> StoreResult<PathBuf> {
        Ok(self.raw_params_dir(table, params)?.join(digest(input)))
    }

    fn entity_dir(&self, table: &str, params: &str) -> StoreResult<PathBuf> {
        Ok(self
            .root
            .join(ENTITY_DIR)
            .join(checked_table(table)?)
            .join(digest(params)))
    }
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::IoError(e.to_string())
}

fn checked_table(table: &str) -> StoreResult<&str> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(table)
    } else {
        Err(StoreError::IoError(format!("invalid table name: {table:?}")))
    }
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(work: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

/// Hex SHA-256 of a key component, used as a directory name.
fn digest(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Order-preserving file name of a page ordinal.
fn page_file_name(page: u32) -> String {
    format!("{page:010}.{PAGE_EXT}")
}

/// Order-preserving file stem for a signed id.
fn row_file_stem(id: i64) -> String {
    format!("{:020}", (id as u64) ^ (1 << 63))
}

fn row_id_from_stem(stem: &str) -> Option<i64> {
    stem.parse::<u64>().ok().map(|v| (v ^ (1 << 63)) as i64)
}

fn write_atomic(path: &Path, contents: &[&[u8]]) -> StoreResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_err)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StoreError::IoError(format!("Failed to create temp file: {e}")))?;
    for chunk in contents {
        temp_file
            .write_all(chunk)
            .map_err(|e| StoreError::IoError(format!("Failed to write temp file: {e}")))?;
    }
    temp_file
        .flush()
        .map_err(|e| StoreError::IoError(format!("Failed to flush temp file: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| StoreError::IoError(format!("Failed to sync temp file: {e}")))?;
    temp_file
        .persist(path)
        .map_err(|e| StoreError::IoError(format!("Failed to persist temp file: {e}")))?;

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn open_lock(dir: &Path) -> StoreResult<RwLock<File>> {
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dir.join(LOCK_FILE))
        .map_err(|e| StoreError::LockError(format!("Failed to create lock file: {e}")))?;
    Ok(RwLock::new(file))
}

fn read_header(path: &Path) -> StoreResult<RawHeader> {
    let file = File::open(path).map_err(io_err)?;
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line).map_err(io_err)?;
    serde_json::from_str(line.trim_end()).map_err(|e| {
        StoreError::SerializationError(format!("bad header in {}: {e}", path.display()))
    })
}

fn read_record(path: &Path) -> StoreResult<RawDataRecord> {
    let mut contents = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut contents))
        .map_err(io_err)?;
    let split = contents.iter().position(|b| *b == b'\n').ok_or_else(|| {
        StoreError::SerializationError(format!("missing header in {}", path.display()))
    })?;
    let header: RawHeader = serde_json::from_slice(&contents[..split])
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(RawDataRecord {
        params: header.params,
        input_id: header.input_id,
        input: header.input,
        page: header.page,
        url: header.url,
        data: Bytes::copy_from_slice(&contents[split + 1..]),
        created_at: header.created_at,
    })
}

/// Entries of `dir`, empty when it does not exist.
fn read_dir_or_empty(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(e)),
    };
    entries
        .map(|entry| entry.map(|e| e.path()).map_err(io_err))
        .collect()
}

/// Pages of one input directory with their ordinals, ascending.
fn list_pages(dir: &Path) -> StoreResult<Vec<(u32, PathBuf)>> {
    let mut pages = Vec::new();
    for path in read_dir_or_empty(dir)? {
        if path.extension().and_then(|e| e.to_str()) != Some(PAGE_EXT) {
            continue;
        }
        match path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
            Some(page) => pages.push((page, path)),
            None => warn!(path = %path.display(), "Ignoring unrecognised page file"),
        }
    }
    pages.sort_unstable_by_key(|(page, _)| *page);
    Ok(pages)
}

/// Page files of every input under a params directory, ordered by
/// `(input identity, page)`.
///
/// Only the first page header of each input is read, to learn its identity.
fn list_params_pages(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut inputs = Vec::new();
    for input_dir in read_dir_or_empty(dir)? {
        if !input_dir.is_dir() {
            continue;
        }
        let pages = list_pages(&input_dir)?;
        let Some((_, first)) = pages.first() else {
            continue;
        };
        let identity = read_header(first)?.input_id;
        inputs.push((identity, pages));
    }
    inputs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(inputs
        .into_iter()
        .flat_map(|(_, pages)| pages.into_iter().map(|(_, path)| path))
        .collect())
}

/// Ids of every row file in `dir`, ascending.
fn list_row_ids(dir: &Path) -> StoreResult<Vec<i64>> {
    let mut ids = Vec::new();
    for path in read_dir_or_empty(dir)? {
        if path.extension().and_then(|e| e.to_str()) != Some(ROW_EXT) {
            continue;
        }
        match path.file_stem().and_then(|s| s.to_str()).and_then(row_id_from_stem) {
            Some(id) => ids.push(id),
            None => warn!(path = %path.display(), "Ignoring unrecognised row file"),
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn read_row(dir: &Path, id: i64) -> StoreResult<EntityRow> {
    let path = dir.join(format!("{}.{ROW_EXT}", row_file_stem(id)));
    let contents = std::fs::read(&path).map_err(io_err)?;
    serde_json::from_slice(&contents).map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn read_rows(dir: &Path) -> StoreResult<Vec<EntityRow>> {
    list_row_ids(dir)?
        .into_iter()
        .map(|id| read_row(dir, id))
        .collect()
}

#[async_trait]
impl RawDataStore for FileStore {
    async fn upsert(&self, table: &str, record: RawDataRecord) -> StoreResult<()> {
        let dir = self.raw_input_dir(table, &record.params, &record.input_id)?;
        blocking(move || {
            let path = dir.join(page_file_name(record.page));
            let header = RawHeader {
                params: record.params,
                input_id: record.input_id,
                input: record.input,
                page: record.page,
                url: record.url,
                created_at: record.created_at,
            };
            let mut line = serde_json::to_vec(&header)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            line.push(b'\n');

            let lock = open_lock(&dir)?;
            let _guard = lock
                .read()
                .map_err(|e| StoreError::LockError(format!("Failed to acquire read lock: {e}")))?;
            write_atomic(&path, &[line.as_slice(), record.data.as_ref()])
        })
        .await
    }

    async fn iterate(&self, table: &str, params: &str) -> StoreResult<RawRecordStream> {
        let dir = self.raw_params_dir(table, params)?;
        let pages = blocking(move || list_params_pages(&dir)).await?;

        let records = stream::iter(pages)
            .then(|path| async move { blocking(move || read_record(&path)).await });
        Ok(Box::pin(records))
    }

    async fn retain_pages(
        &self,
        table: &str,
        params: &str,
        input: &str,
        pages: u32,
    ) -> StoreResult<u64> {
        let dir = self.raw_input_dir(table, params, input)?;
        blocking(move || {
            if !dir.is_dir() {
                return Ok(0);
            }
            let mut lock = open_lock(&dir)?;
            let _guard = lock
                .write()
                .map_err(|e| StoreError::LockError(format!("Failed to acquire write lock: {e}")))?;

            let mut removed = 0;
            for (page, path) in list_pages(&dir)? {
                if page > pages {
                    std::fs::remove_file(&path).map_err(io_err)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }

    async fn has_data(&self, table: &str, params: &str) -> StoreResult<bool> {
        let dir = self.raw_params_dir(table, params)?;
        blocking(move || {
            for input_dir in read_dir_or_empty(&dir)? {
                if input_dir.is_dir() && !list_pages(&input_dir)?.is_empty() {
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .await
    }
}

#[async_trait]
impl EntityStore for FileStore {
    async fn upsert_rows(&self, table: &str, rows: Vec<EntityRow>) -> StoreResult<()> {
        let mut targets = Vec::with_capacity(rows.len());
        for row in rows {
            targets.push((self.entity_dir(table, &row.params)?, row));
        }
        blocking(move || {
            for (dir, row) in targets {
                let encoded = serde_json::to_vec(&row)
                    .map_err(|e| StoreError::SerializationError(e.to_string()))?;
                let path = dir.join(format!("{}.{ROW_EXT}", row_file_stem(row.id)));
                write_atomic(&path, &[encoded.as_slice()])?;
            }
            Ok(())
        })
        .await
    }

    async fn scan(
        &self,
        table: &str,
        filter: &RowFilter,
        after: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<EntityRow>> {
        let dir = self.entity_dir(table, &filter.params)?;
        let filter = filter.clone();
        blocking(move || {
            let mut rows = Vec::new();
            for id in list_row_ids(&dir)? {
                if rows.len() >= limit {
                    break;
                }
                if after.is_some_and(|after| id <= after) {
                    continue;
                }
                let row = read_row(&dir, id)?;
                if filter.matches(&row) {
                    rows.push(row);
                }
            }
            Ok(rows)
        })
        .await
    }

    async fn max_updated_at(
        &self,
        table: &str,
        params: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let dir = self.entity_dir(table, params)?;
        blocking(move || Ok(read_rows(&dir)?.into_iter().filter_map(|row| row.updated_at).max()))
            .await
    }

    async fn count(&self, table: &str, params: &str) -> StoreResult<u64> {
        let dir = self.entity_dir(table, params)?;
        blocking(move || Ok(list_row_ids(&dir)?.len() as u64)).await
    }
}
