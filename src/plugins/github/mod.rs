//! GitHub Actions integration
//!
//! Four stages, registered in this order:
//!
//! 1. `collect_runs` - workflow runs of one repository into `github_api_runs`
//! 2. `extract_runs` - `github_api_runs` into `github_runs` rows
//! 3. `collect_jobs` - jobs of every stored run into `github_api_jobs`,
//!    incremental against `github_jobs`
//! 4. `extract_jobs` - `github_api_jobs` into `github_jobs` rows
//!
//! Task options: `full_sync` (bool) disables incremental job collection and
//! `time_after` (RFC 3339) restricts both runs and jobs to newer data.

pub mod job_collector;
pub mod job_extractor;
pub mod models;
pub mod run_collector;
pub mod run_extractor;

pub use models::{GithubJob, GithubParams, GithubRun, RunRef};

use crate::collector::client::ApiResponse;
use crate::collector::pager::total_pages_from_link;
use crate::collector::strategy::pages_for_count;
use crate::collector::{PageHint, Pager};
use crate::store::{EntityRow, RawDataRecord};
use crate::subtask::{RegistryError, StageReport, SubTaskError, SubTaskRegistry, TaskContext};
use futures_util::StreamExt;
use tracing::{debug, info};

/// Raw workflow run pages
pub const RAW_RUN_TABLE: &str = "github_api_runs";
/// Workflow run rows
pub const RUN_TABLE: &str = "github_runs";
/// Raw job pages
pub const RAW_JOB_TABLE: &str = "github_api_jobs";
/// Job rows
pub const JOB_TABLE: &str = "github_jobs";

/// Domain tag of every stage here
pub const DOMAIN_CICD: &str = "CICD";

/// Task option: ignore the watermark and collect every run's jobs
pub const OPTION_FULL_SYNC: &str = "full_sync";
/// Task option: only collect data updated after this instant
pub const OPTION_TIME_AFTER: &str = "time_after";

/// Rows written per entity store call during extraction
const EXTRACT_BATCH: usize = 500;

/// Register the GitHub stages.
pub fn register(registry: &mut SubTaskRegistry) -> Result<(), RegistryError> {
    registry.register(run_collector::COLLECT_RUNS_META)?;
    registry.register(run_extractor::EXTRACT_RUNS_META)?;
    registry.register(job_collector::COLLECT_JOBS_META)?;
    registry.register(job_extractor::EXTRACT_JOBS_META)?;
    Ok(())
}

/// Pagination hint for a GitHub list response.
///
/// The `Link` header's `rel="last"` wins; it is missing on the last page, so
/// the body's `total_count` is the fallback.
fn page_hint(response: &ApiResponse, pager: &Pager, total_count: Option<u64>) -> PageHint {
    if let Some(total) = total_pages_from_link(&response.headers) {
        return PageHint::TotalPages(total);
    }
    match total_count {
        Some(count) => PageHint::TotalPages(pages_for_count(count, pager.size)),
        None => PageHint::Unknown,
    }
}

/// Turn every raw record of `raw_table` into rows of `entity_table`.
///
/// Rows are upserted in batches, so re-extraction replaces rather than
/// duplicates. Cancellation is checked between records.
async fn extract_table<F>(
    ctx: &TaskContext,
    raw_table: &str,
    entity_table: &str,
    mut to_rows: F,
) -> Result<StageReport, SubTaskError>
where
    F: FnMut(&RawDataRecord, &str) -> Result<Vec<EntityRow>, SubTaskError>,
{
    let params = ctx.params_key();
    let mut records = ctx.raw.iterate(raw_table, &params).await?;
    let mut batch: Vec<EntityRow> = Vec::with_capacity(EXTRACT_BATCH);
    let mut pages = 0u64;
    let mut rows = 0u64;

    while let Some(record) = records.next().await {
        if ctx.cancel.is_cancelled() {
            info!(table = raw_table, pages, "Extraction cancelled");
            return Err(SubTaskError::Cancelled);
        }
        let record = record?;
        let extracted = to_rows(&record, &params)?;
        rows += extracted.len() as u64;
        batch.extend(extracted);
        pages += 1;

        if batch.len() >= EXTRACT_BATCH {
            ctx.entities
                .upsert_rows(entity_table, std::mem::take(&mut batch))
                .await?;
            debug!(table = entity_table, rows, "Flushed extracted rows");
        }
    }
    if !batch.is_empty() {
        ctx.entities.upsert_rows(entity_table, batch).await?;
    }

    info!(from = raw_table, to = entity_table, pages, rows, "Extraction finished");
    Ok(StageReport::with_message(
        rows,
        format!("extracted {rows} rows from {pages} pages"),
    ))
}

/// Decode a raw page payload (a JSON array of items).
fn decode_page<T: serde::de::DeserializeOwned>(record: &RawDataRecord) -> Result<Vec<T>, SubTaskError> {
    serde_json::from_slice(&record.data).map_err(|e| {
        SubTaskError::Extraction(format!(
            "page {} of input {} ({}): {e}",
            record.page, record.input_id, record.url
        ))
    })
}
