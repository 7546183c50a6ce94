//! Collect workflow runs of one repository.

use super::{page_hint, DOMAIN_CICD, OPTION_TIME_AFTER, RAW_RUN_TABLE};
use crate::collector::client::ApiResponse;
use crate::collector::strategy::{page_query, parse_envelope};
use crate::collector::{
    CollectionStrategy, ParseError, ParsedPage, Pager, RequestData, StatefulApiCollector,
};
use crate::cursor::single_input;
use crate::subtask::{StageReport, SubTaskError, SubTaskMeta, TaskContext};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};

/// Runs endpoint; one synthetic input drives it
pub const RUNS_URL: &str = "repos/{params.name}/actions/runs";

/// Stage descriptor
pub const COLLECT_RUNS_META: SubTaskMeta = SubTaskMeta {
    name: "collect_runs",
    description: "Collect workflow runs from the GitHub Actions API",
    entry_point: collect_runs,
    enabled_by_default: true,
    domain_types: &[DOMAIN_CICD],
    dependency_tables: &[],
    product_tables: &[RAW_RUN_TABLE],
    skip_on_fail: false,
};

/// `workflow_runs` envelope, optionally restricted by creation time.
#[derive(Debug, Default)]
pub struct RunsStrategy {
    created_after: Option<DateTime<Utc>>,
}

impl RunsStrategy {
    /// Only request runs created after `time_after`.
    pub fn new(time_after: Option<DateTime<Utc>>) -> Self {
        Self {
            created_after: time_after,
        }
    }
}

impl CollectionStrategy<Value> for RunsStrategy {
    fn build_request(&self, request: &RequestData<'_, Value>) -> Vec<(String, String)> {
        let mut query = page_query(request.pager);
        if let Some(after) = self.created_after {
            query.push((
                "created".to_string(),
                format!(">{}", after.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ));
        }
        query
    }

    fn parse_response(&self, response: &ApiResponse, pager: &Pager) -> Result<ParsedPage, ParseError> {
        let envelope = parse_envelope(&response.body, "workflow_runs", Some("total_count"))?;
        Ok(ParsedPage {
            hint: page_hint(response, pager, envelope.total_count),
            items: envelope.items,
        })
    }
}

fn collect_runs(ctx: &mut TaskContext) -> BoxFuture<'_, Result<StageReport, SubTaskError>> {
    Box::pin(async move {
        let time_after: Option<DateTime<Utc>> = ctx.option(OPTION_TIME_AFTER)?;
        let collector = StatefulApiCollector::<Value, _>::new(
            RAW_RUN_TABLE,
            ctx.params().clone(),
            RUNS_URL,
            RunsStrategy::new(time_after),
            ctx.client.clone(),
            ctx.raw.clone(),
        )?
        .with_settings(ctx.settings.clone())
        .with_cancellation(ctx.cancel.clone());

        let summary = collector.execute(single_input(json!({ "id": "runs" }))).await;
        StageReport::from_collection(summary, ctx.settings.max_skip_ratio)
    })
}
