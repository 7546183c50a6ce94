//! The GitHub Actions pipeline end to end on an in-memory store

use crate::support::{github_context, ok_json, status, ScriptedClient};
use serde_json::json;
use stateful_collector::collector::FailureKind;
use stateful_collector::plugins::default_registry;
use stateful_collector::plugins::github::{JOB_TABLE, RAW_JOB_TABLE, RAW_RUN_TABLE, RUN_TABLE};
use stateful_collector::store::{EntityRow, EntityStore, RawDataStore};
use stateful_collector::subtask::{PipelineRunner, StageState};

const RUNS_PATH: &str = "repos/octo/repo/actions/runs";

fn runs_body() -> serde_json::Value {
    json!({
        "total_count": 3,
        "workflow_runs": [
            { "id": 1, "name": "ci", "status": "completed", "updated_at": "2024-05-01T10:00:00Z" },
            { "id": 2, "name": "ci", "status": "completed", "updated_at": "2024-05-02T10:00:00Z" },
            { "id": 3, "name": "ci", "status": "in_progress", "updated_at": "2024-05-03T10:00:00Z",
              "run_started_at": "0001-01-01T00:00:00Z" }
        ]
    })
}

fn jobs_body(run: u32) -> serde_json::Value {
    json!({
        "total_count": 2,
        "jobs": [
            { "id": run * 100 + 1, "run_id": run, "name": "build", "completed_at": "0001-01-01T00:00:00Z" },
            { "id": run * 100 + 2, "run_id": run, "name": "test" }
        ]
    })
}

#[tokio::test]
async fn test_full_pipeline_isolates_deleted_run() {
    let client = ScriptedClient::new(|req| match req.path.as_str() {
        RUNS_PATH => ok_json(&req.path, runs_body()),
        "repos/octo/repo/actions/runs/2/jobs" => status(404, &req.path, r#"{"message":"Not Found"}"#),
        path if path.starts_with("repos/octo/repo/actions/runs/1/") => ok_json(path, jobs_body(1)),
        path => ok_json(path, jobs_body(3)),
    });
    let (ctx, store) = github_context(client.clone());
    let registry = default_registry().unwrap();

    let report = PipelineRunner::new(&registry).run(&ctx).await.unwrap();

    assert!(report.is_success());
    let names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["collect_runs", "extract_runs", "collect_jobs", "extract_jobs"]);
    assert!(report.stages.iter().all(|s| s.state == StageState::Completed));

    let collect_jobs = report.stage("collect_jobs").unwrap();
    let jobs_report = collect_jobs.report.as_ref().unwrap();
    assert_eq!(jobs_report.processed, 2);
    assert!(jobs_report.partial);
    assert_eq!(jobs_report.skipped.len(), 1);
    assert_eq!(jobs_report.skipped[0].kind, FailureKind::NotFound);

    let params = ctx.params_key();
    assert_eq!(store.count(RUN_TABLE, &params).await.unwrap(), 3);
    assert_eq!(store.count(JOB_TABLE, &params).await.unwrap(), 4);
    assert_eq!(store.raw_record_count(RAW_RUN_TABLE), 1);
    assert_eq!(store.raw_record_count(RAW_JOB_TABLE), 2);
}

#[tokio::test]
async fn test_failed_root_stage_blocks_stale_dependents() {
    let client = ScriptedClient::new(|req| status(401, &req.path, r#"{"message":"Bad credentials"}"#));
    let (ctx, store) = github_context(client.clone());
    let params = ctx.params_key();
    // Rows from an earlier run must not be consumed after a failed refresh
    store
        .upsert_rows(
            RUN_TABLE,
            vec![EntityRow {
                id: 1,
                params: params.clone(),
                updated_at: None,
                data: json!({ "id": 1 }),
            }],
        )
        .await
        .unwrap();
    let registry = default_registry().unwrap();

    let report = PipelineRunner::new(&registry).run(&ctx).await.unwrap();

    assert!(!report.is_success());
    let collect_runs = report.stage("collect_runs").unwrap();
    assert_eq!(collect_runs.state, StageState::Failed);
    assert!(collect_runs.error.as_deref().unwrap().contains("Bad credentials"));
    for name in ["extract_runs", "collect_jobs", "extract_jobs"] {
        assert_eq!(report.stage(name).unwrap().state, StageState::Skipped, "{name}");
    }
    assert_eq!(client.request_count(), 1);
    assert!(!store.has_data(RAW_JOB_TABLE, &params).await.unwrap());
}

#[tokio::test]
async fn test_skip_on_fail_stage_lets_extraction_run() {
    let client = ScriptedClient::new(|req| match req.path.as_str() {
        RUNS_PATH => ok_json(&req.path, runs_body()),
        "repos/octo/repo/actions/runs/1/jobs" => ok_json(&req.path, jobs_body(1)),
        path => status(403, path, r#"{"message":"Resource not accessible by integration"}"#),
    });
    let (ctx, store) = github_context(client.clone());
    let ctx = ctx.with_settings(crate::support::fast_settings().with_workers(1));
    let registry = default_registry().unwrap();

    let report = PipelineRunner::new(&registry).run(&ctx).await.unwrap();

    let collect_jobs = report.stage("collect_jobs").unwrap();
    assert_eq!(collect_jobs.state, StageState::Failed);
    assert!(collect_jobs.skip_on_fail);
    assert!(report.is_success());

    let extract_jobs = report.stage("extract_jobs").unwrap();
    assert_eq!(extract_jobs.state, StageState::Completed);
    assert_eq!(store.count(JOB_TABLE, &ctx.params_key()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_selection_runs_only_named_stages() {
    let client = ScriptedClient::new(|req| ok_json(&req.path, runs_body()));
    let (ctx, store) = github_context(client.clone());
    let registry = default_registry().unwrap();

    let report = PipelineRunner::new(&registry)
        .with_selection(Some(vec!["collect_runs".to_string(), "extract_runs".to_string()]))
        .run(&ctx)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.stage("extract_runs").unwrap().state, StageState::Completed);
    let collect_jobs = report.stage("collect_jobs").unwrap();
    assert_eq!(collect_jobs.state, StageState::Skipped);
    assert_eq!(collect_jobs.reason.as_deref(), Some("not enabled"));
    assert_eq!(client.request_count(), 1);
    assert_eq!(store.count(RUN_TABLE, &ctx.params_key()).await.unwrap(), 3);
}
