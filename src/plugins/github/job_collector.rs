//! Collect the jobs of every stored workflow run.
//!
//! Runs are read back from `github_runs` through a cursor. Unless `full_sync`
//! is set and once `github_jobs` holds rows for the repository, only runs
//! updated after the newest collected job's run are fetched. A run that has
//! since been deleted (404) or keeps failing upstream is skipped without
//! failing the stage, and the stage itself is marked `skip_on_fail` so
//! extraction still runs on whatever was collected.

use super::models::RunRef;
use super::{
    page_hint, DOMAIN_CICD, JOB_TABLE, OPTION_FULL_SYNC, OPTION_TIME_AFTER, RAW_JOB_TABLE,
    RUN_TABLE,
};
use crate::collector::client::ApiResponse;
use crate::collector::strategy::parse_envelope;
use crate::collector::{CollectionStrategy, ParseError, ParsedPage, Pager, StatefulApiCollector};
use crate::cursor::CursorIterator;
use crate::subtask::{StageReport, SubTaskError, SubTaskMeta, TaskContext};
use crate::sync_state::SyncStateResolver;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::info;

/// Jobs endpoint for one run
pub const JOBS_URL: &str = "repos/{params.name}/actions/runs/{input.id}/jobs";

/// Stage descriptor
pub const COLLECT_JOBS_META: SubTaskMeta = SubTaskMeta {
    name: "collect_jobs",
    description: "Collect workflow jobs from the GitHub Actions API; supports time filter and incremental sync",
    entry_point: collect_jobs,
    enabled_by_default: true,
    domain_types: &[DOMAIN_CICD],
    dependency_tables: &[RUN_TABLE],
    product_tables: &[RAW_JOB_TABLE],
    skip_on_fail: true,
};

/// `jobs` envelope with `total_count`
#[derive(Debug, Default)]
pub struct JobsStrategy;

impl CollectionStrategy<RunRef> for JobsStrategy {
    fn parse_response(&self, response: &ApiResponse, pager: &Pager) -> Result<ParsedPage, ParseError> {
        let envelope = parse_envelope(&response.body, "jobs", Some("total_count"))?;
        Ok(ParsedPage {
            hint: page_hint(response, pager, envelope.total_count),
            items: envelope.items,
        })
    }
}

fn collect_jobs(ctx: &mut TaskContext) -> BoxFuture<'_, Result<StageReport, SubTaskError>> {
    Box::pin(async move {
        let params = ctx.params_key();
        let full_sync = ctx.flag(OPTION_FULL_SYNC, false)?;
        let time_after: Option<DateTime<Utc>> = ctx.option(OPTION_TIME_AFTER)?;

        let state = SyncStateResolver::new(ctx.entities.clone(), JOB_TABLE, !full_sync)
            .resolve(&params)
            .await?;
        let filter = state.input_filter(&params, time_after);
        info!(
            mode = ?state.mode,
            updated_after = ?filter.updated_after,
            "Selecting runs for job collection"
        );

        let inputs = CursorIterator::<RunRef>::new(ctx.entities.clone(), RUN_TABLE, filter).into_stream();
        let collector = StatefulApiCollector::<RunRef, _>::new(
            RAW_JOB_TABLE,
            ctx.params().clone(),
            JOBS_URL,
            JobsStrategy,
            ctx.client.clone(),
            ctx.raw.clone(),
        )?
        .with_settings(ctx.settings.clone())
        .with_cancellation(ctx.cancel.clone());

        let summary = collector.execute(inputs).await;
        StageReport::from_collection(summary, ctx.settings.max_skip_ratio)
    })
}
