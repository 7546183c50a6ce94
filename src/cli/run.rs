//! `run` command: execute the GitHub pipeline for one repository.

use super::{print_json, CliError, OutputFormat};
use crate::collector::config::{DEFAULT_MAX_RETRIES, MAX_RETRIES_LIMIT, MAX_WORKERS};
use crate::collector::{CollectorSettings, HttpApiClient, RateLimiter, RetryPolicy};
use crate::metrics;
use crate::plugins::default_registry;
use crate::plugins::github::{GithubParams, OPTION_FULL_SYNC, OPTION_TIME_AFTER};
use crate::shutdown::SharedCancellation;
use crate::store::FileStore;
use crate::subtask::{
    PipelineReport, PipelineRunner, StageObserver, StageRecord, StageState, SubTaskMeta, TaskContext,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Arguments of the `run` command
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Repository full name (owner/repo)
    #[arg(long)]
    pub repo: String,

    /// Connection id that namespaces every stored record
    #[arg(long, default_value_t = 1)]
    pub connection_id: u64,

    /// API base URL
    #[arg(long, default_value = "https://api.github.com")]
    pub endpoint: String,

    /// Bearer token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Root directory of the raw and entity tables
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Input items fetched concurrently (default: 4, max: 32)
    #[arg(long, default_value = "4", value_parser = parse_workers)]
    pub workers: usize,

    /// Retries per page after a transport error, 429, or 5xx (range: 0-20)
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_RETRIES,
        value_parser = clap::value_parser!(u32).range(0..=MAX_RETRIES_LIMIT as i64)
    )]
    pub max_retries: u32,

    /// Items requested per page (range: 1-100)
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub page_size: u32,

    /// Upstream request budget per hour, shared by all workers
    #[arg(long)]
    pub rate_limit: Option<usize>,

    /// Ignore the incremental watermark and revisit every run
    #[arg(long, default_value_t = false)]
    pub full_sync: bool,

    /// Only collect data updated after this time (YYYY-MM-DD or RFC3339)
    #[arg(long, value_parser = parse_since)]
    pub since: Option<DateTime<Utc>>,

    /// Comma separated stage names to run instead of the defaults
    #[arg(long, value_delimiter = ',')]
    pub subtasks: Option<Vec<String>>,

    /// Fail a collection stage when more than this fraction of items is skipped
    #[arg(long, value_parser = parse_skip_ratio)]
    pub max_skip_ratio: Option<f64>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

/// Try to parse datetime from RFC3339 format.
///
/// Inputs without a timezone designator are taken as UTC.
fn try_parse_datetime_rfc3339(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&format!("{input}Z")) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

/// Parse `--since` from YYYY-MM-DD (start of day, UTC) or RFC3339.
fn parse_since(input: &str) -> Result<DateTime<Utc>, String> {
    if let Some(dt) = try_parse_datetime_rfc3339(input) {
        return Ok(dt);
    }

    let date = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| format!("invalid time '{input}': {e}"))?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid time '{input}'"))
}

/// Parse and validate the worker count
fn parse_workers(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("workers must be at least 1".to_string());
    }
    if value > MAX_WORKERS {
        return Err(format!("workers {value} exceeds maximum of {MAX_WORKERS}"));
    }
    Ok(value)
}

fn parse_skip_ratio(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid ratio"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("skip ratio {value} must be between 0 and 1"));
    }
    Ok(value)
}

/// Spinner showing the running stage.
struct SpinnerObserver {
    bar: ProgressBar,
}

impl SpinnerObserver {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

#[async_trait]
impl StageObserver for SpinnerObserver {
    async fn stage_started(&self, meta: &SubTaskMeta) {
        self.bar.set_message(format!("{}: {}", meta.name, meta.description));
    }

    async fn stage_finished(&self, record: &StageRecord) {
        if record.state != StageState::Skipped {
            self.bar.println(format!("{} {}", record.state, record.name));
        }
    }
}

impl RunArgs {
    fn params(&self) -> Result<GithubParams, CliError> {
        let repo = self.repo.trim();
        match repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(GithubParams {
                    connection_id: self.connection_id,
                    name: repo.to_string(),
                })
            }
            _ => Err(CliError::InvalidArgument(format!(
                "repository must be owner/repo, got '{}'",
                self.repo
            ))),
        }
    }

    fn settings(&self) -> CollectorSettings {
        let mut settings = CollectorSettings::default()
            .with_workers(self.workers)
            .with_page_size(self.page_size)
            .with_retry(RetryPolicy::default().with_max_retries(self.max_retries));
        if let Some(per_hour) = self.rate_limit {
            settings = settings.with_rate_limiter(Arc::new(RateLimiter::per_hour(per_hour)));
        }
        if let Some(ratio) = self.max_skip_ratio {
            settings = settings.with_max_skip_ratio(ratio);
        }
        settings
    }

    /// Execute the pipeline and print its report.
    pub async fn execute(
        &self,
        format: OutputFormat,
        cancel: SharedCancellation,
    ) -> Result<PipelineReport, CliError> {
        let params = self.params()?;

        if let Some(addr) = self.metrics_addr {
            metrics::init_metrics(addr)
                .await
                .map_err(|e| CliError::ConfigurationError(e.to_string()))?;
            info!(addr = %addr, "Metrics exporter listening");
        }

        let store = Arc::new(FileStore::open(&self.data_dir)?);
        let client = HttpApiClient::new(&self.endpoint)?.with_token(self.token.clone());
        let mut ctx = TaskContext::new(store.clone(), store, Arc::new(client), params.to_value())
            .with_cancellation(cancel)
            .with_settings(self.settings())
            .with_option(OPTION_FULL_SYNC, self.full_sync);
        if let Some(since) = self.since {
            ctx.set_option(OPTION_TIME_AFTER, since);
        }

        let registry = default_registry()?;
        let mut runner = PipelineRunner::new(&registry).with_selection(self.subtasks.clone());
        let spinner = match format {
            OutputFormat::Human => {
                let observer = Arc::new(SpinnerObserver::new());
                runner = runner.with_observer(observer.clone());
                Some(observer)
            }
            OutputFormat::Json => None,
        };

        info!(
            repo = %params.name,
            connection_id = params.connection_id,
            data_dir = %self.data_dir.display(),
            "Starting pipeline"
        );
        let result = runner.run(&ctx).await;
        if let Some(spinner) = spinner {
            spinner.bar.finish_and_clear();
        }
        let report = result?;

        match format {
            OutputFormat::Json => output_json(&params, &report)?,
            OutputFormat::Human => output_human(&params, &report),
        }

        if !report.is_success() {
            let failed = report
                .stages
                .iter()
                .filter(|stage| stage.is_blocking_failure())
                .map(|stage| stage.name.clone())
                .collect();
            return Err(CliError::PipelineFailed(failed));
        }
        Ok(report)
    }
}

fn output_json(params: &GithubParams, report: &PipelineReport) -> Result<(), CliError> {
    print_json(&json!({
        "success": report.is_success(),
        "cancelled": report.is_cancelled(),
        "repo": params.name,
        "connection_id": params.connection_id,
        "stages": report.stages,
    }))
}

fn output_human(params: &GithubParams, report: &PipelineReport) {
    println!("\nPipeline for {} (connection {})", params.name, params.connection_id);
    for stage in &report.stages {
        match (&stage.report, &stage.error, &stage.reason) {
            (Some(result), _, _) => {
                let partial = if result.partial { " [partial]" } else { "" };
                println!(
                    "  {:<10} {:<14} processed {}, skipped {}{partial}: {}",
                    stage.state.to_string(),
                    stage.name,
                    result.processed,
                    result.skipped.len(),
                    result.message
                );
                for failure in &result.skipped {
                    println!("      skipped {failure}");
                }
            }
            (None, Some(error), _) => {
                let tolerated = if stage.skip_on_fail { " (tolerated)" } else { "" };
                println!(
                    "  {:<10} {:<14} {error}{tolerated}",
                    stage.state.to_string(),
                    stage.name
                );
            }
            (None, None, reason) => println!(
                "  {:<10} {:<14} {}",
                stage.state.to_string(),
                stage.name,
                reason.as_deref().unwrap_or("")
            ),
        }
    }

    if report.is_cancelled() {
        println!("Result: cancelled, persisted pages are kept");
    } else if report.is_success() {
        println!("Result: success");
    } else {
        eprintln!("Result: failed");
    }
}
