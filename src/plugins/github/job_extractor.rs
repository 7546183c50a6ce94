//! Turn raw job pages into `github_jobs` rows.
//!
//! A row's `updated_at` is the driving run's `updated_at`, taken from the raw
//! record's input. The jobs endpoint has no update time of its own, and the
//! run's is what the next incremental `collect_jobs` compares against.

use super::models::{GithubJob, RunRef};
use super::{decode_page, extract_table, DOMAIN_CICD, JOB_TABLE, RAW_JOB_TABLE};
use crate::store::{EntityRow, RawDataRecord};
use crate::subtask::{StageReport, SubTaskError, SubTaskMeta, TaskContext};
use futures::future::BoxFuture;

/// Stage descriptor
pub const EXTRACT_JOBS_META: SubTaskMeta = SubTaskMeta {
    name: "extract_jobs",
    description: "Extract workflow jobs from raw pages",
    entry_point: extract_jobs,
    enabled_by_default: true,
    domain_types: &[DOMAIN_CICD],
    dependency_tables: &[RAW_JOB_TABLE],
    product_tables: &[JOB_TABLE],
    skip_on_fail: false,
};

fn extract_jobs(ctx: &mut TaskContext) -> BoxFuture<'_, Result<StageReport, SubTaskError>> {
    Box::pin(async move { extract_table(ctx, RAW_JOB_TABLE, JOB_TABLE, job_rows).await })
}

pub(crate) fn job_rows(record: &RawDataRecord, params: &str) -> Result<Vec<EntityRow>, SubTaskError> {
    let run: RunRef = serde_json::from_value(record.input.clone()).map_err(|e| {
        SubTaskError::Extraction(format!("input {} is not a run: {e}", record.input_id))
    })?;

    decode_page::<GithubJob>(record)?
        .into_iter()
        .map(|job| -> Result<EntityRow, SubTaskError> {
            let data = serde_json::to_value(&job)
                .map_err(|e| SubTaskError::Extraction(format!("job {}: {e}", job.id)))?;
            Ok(EntityRow {
                id: job.id,
                params: params.to_string(),
                updated_at: run.updated_at,
                data,
            })
        })
        .collect()
}
