//! Turn raw run pages into `github_runs` rows.

use super::models::GithubRun;
use super::{decode_page, extract_table, DOMAIN_CICD, RAW_RUN_TABLE, RUN_TABLE};
use crate::store::{EntityRow, RawDataRecord};
use crate::subtask::{StageReport, SubTaskError, SubTaskMeta, TaskContext};
use futures::future::BoxFuture;

/// Stage descriptor
pub const EXTRACT_RUNS_META: SubTaskMeta = SubTaskMeta {
    name: "extract_runs",
    description: "Extract workflow runs from raw pages",
    entry_point: extract_runs,
    enabled_by_default: true,
    domain_types: &[DOMAIN_CICD],
    dependency_tables: &[RAW_RUN_TABLE],
    product_tables: &[RUN_TABLE],
    skip_on_fail: false,
};

fn extract_runs(ctx: &mut TaskContext) -> BoxFuture<'_, Result<StageReport, SubTaskError>> {
    Box::pin(async move { extract_table(ctx, RAW_RUN_TABLE, RUN_TABLE, run_rows).await })
}

pub(crate) fn run_rows(record: &RawDataRecord, params: &str) -> Result<Vec<EntityRow>, SubTaskError> {
    decode_page::<GithubRun>(record)?
        .into_iter()
        .map(|run| -> Result<EntityRow, SubTaskError> {
            let data = serde_json::to_value(&run)
                .map_err(|e| SubTaskError::Extraction(format!("run {}: {e}", run.id)))?;
            Ok(EntityRow {
                id: run.id,
                params: params.to_string(),
                updated_at: run.updated_at,
                data,
            })
        })
        .collect()
}
