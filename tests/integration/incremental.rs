//! Incremental job collection driven by the `github_jobs` watermark

use crate::support::{github_context, ok_json, ScriptedClient};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use stateful_collector::plugins::github::job_collector::COLLECT_JOBS_META;
use stateful_collector::plugins::github::job_extractor::EXTRACT_JOBS_META;
use stateful_collector::plugins::github::{JOB_TABLE, RAW_JOB_TABLE, RUN_TABLE};
use stateful_collector::store::{EntityRow, EntityStore, MemoryStore, RowFilter};
use stateful_collector::subtask::TaskContext;
use std::sync::Arc;

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
}

fn jobs_client() -> Arc<ScriptedClient> {
    ScriptedClient::new(|req| {
        let run_id: i64 = req
            .path
            .trim_end_matches("/jobs")
            .rsplit('/')
            .next()
            .and_then(|id| id.parse().ok())
            .expect("run id in path");
        ok_json(
            &req.path,
            json!({
                "total_count": 1,
                "jobs": [{ "id": run_id * 10, "run_id": run_id, "name": "build", "status": "completed" }]
            }),
        )
    })
}

/// Runs 1..=5, run `n` updated on March `n`
async fn seed_runs(ctx: &TaskContext, store: &MemoryStore) {
    let params = ctx.params_key();
    let rows = (1..=5)
        .map(|n| EntityRow {
            id: n,
            params: params.clone(),
            updated_at: Some(day(n as u32)),
            data: json!({ "id": n, "updated_at": day(n as u32) }),
        })
        .collect();
    store.upsert_rows(RUN_TABLE, rows).await.unwrap();
}

async fn seed_job_watermark(ctx: &TaskContext, store: &MemoryStore, at: DateTime<Utc>) {
    let row = EntityRow {
        id: 999,
        params: ctx.params_key(),
        updated_at: Some(at),
        data: json!({ "id": 999, "run_id": 0 }),
    };
    store.upsert_rows(JOB_TABLE, vec![row]).await.unwrap();
}

fn run_paths(client: &ScriptedClient) -> Vec<String> {
    let mut paths = client.paths();
    paths.sort();
    paths
}

fn jobs_path(run: i64) -> String {
    format!("repos/octo/repo/actions/runs/{run}/jobs")
}

#[tokio::test]
async fn test_first_collection_fetches_every_run() {
    let client = jobs_client();
    let (mut ctx, store) = github_context(client.clone());
    seed_runs(&ctx, &store).await;

    let report = (COLLECT_JOBS_META.entry_point)(&mut ctx).await.unwrap();

    assert_eq!(report.processed, 5);
    assert!(!report.partial);
    assert_eq!(client.paths().len(), 5);
    assert_eq!(store.raw_record_count(RAW_JOB_TABLE), 5);
}

#[tokio::test]
async fn test_watermark_limits_collection_to_newer_runs() {
    let client = jobs_client();
    let (mut ctx, store) = github_context(client.clone());
    seed_runs(&ctx, &store).await;
    seed_job_watermark(&ctx, &store, day(2)).await;

    let report = (COLLECT_JOBS_META.entry_point)(&mut ctx).await.unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(run_paths(&client), vec![jobs_path(3), jobs_path(4), jobs_path(5)]);
}

#[tokio::test]
async fn test_full_sync_ignores_watermark() {
    let client = jobs_client();
    let (ctx, store) = github_context(client.clone());
    let mut ctx = ctx.with_option("full_sync", true);
    seed_runs(&ctx, &store).await;
    seed_job_watermark(&ctx, &store, day(2)).await;

    (COLLECT_JOBS_META.entry_point)(&mut ctx).await.unwrap();

    assert_eq!(client.paths().len(), 5);
}

#[tokio::test]
async fn test_later_of_watermark_and_time_after_wins() {
    let client = jobs_client();
    let (ctx, store) = github_context(client.clone());
    let mut ctx = ctx.with_option("time_after", day(3));
    seed_runs(&ctx, &store).await;
    seed_job_watermark(&ctx, &store, day(2)).await;

    (COLLECT_JOBS_META.entry_point)(&mut ctx).await.unwrap();

    assert_eq!(run_paths(&client), vec![jobs_path(4), jobs_path(5)]);
}

#[tokio::test]
async fn test_extracted_jobs_advance_the_watermark() {
    let client = jobs_client();
    let (mut ctx, store) = github_context(client.clone());
    seed_runs(&ctx, &store).await;

    (COLLECT_JOBS_META.entry_point)(&mut ctx).await.unwrap();
    let extracted = (EXTRACT_JOBS_META.entry_point)(&mut ctx).await.unwrap();
    assert_eq!(extracted.processed, 5);

    let rows = store
        .scan(JOB_TABLE, &RowFilter::for_params(ctx.params_key()), None, 100)
        .await
        .unwrap();
    let job_30 = rows.iter().find(|row| row.id == 30).expect("job of run 3");
    assert_eq!(job_30.updated_at, Some(day(3)));
    assert_eq!(job_30.data["run_id"], 3);
    assert_eq!(
        store.max_updated_at(JOB_TABLE, &ctx.params_key()).await.unwrap(),
        Some(day(5))
    );

    // Nothing changed upstream since run 5
    let before = client.request_count();
    let report = (COLLECT_JOBS_META.entry_point)(&mut ctx).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(client.request_count(), before);
}

#[tokio::test]
async fn test_other_params_do_not_share_watermarks() {
    let client = jobs_client();
    let (mut ctx, store) = github_context(client.clone());
    seed_runs(&ctx, &store).await;
    let foreign = EntityRow {
        id: 1000,
        params: json!({ "connection_id": 2, "name": "octo/repo" }).to_string(),
        updated_at: Some(day(5)),
        data: json!({ "id": 1000, "run_id": 0 }),
    };
    store.upsert_rows(JOB_TABLE, vec![foreign]).await.unwrap();

    (COLLECT_JOBS_META.entry_point)(&mut ctx).await.unwrap();

    assert_eq!(client.paths().len(), 5);
}
