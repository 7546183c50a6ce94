//! Sequential pipeline execution.
//!
//! Stages run one at a time in the registry's execution order. Each gets its
//! own clone of the [`TaskContext`]; the run shares only the stores, the
//! client, and the cancellation signal.

use super::registry::{RegistryError, SubTaskRegistry};
use super::{StageReport, SubTaskError, SubTaskMeta, TaskContext};
use crate::metrics;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

/// Per-run stage state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    /// Not yet considered
    Pending,
    /// Entry point executing
    Running,
    /// Entry point returned a report
    Completed,
    /// Entry point returned a fatal error
    Failed,
    /// Not run: disabled, blocked, without input, or after cancellation
    Skipped,
    /// Entry point observed cancellation
    Cancelled,
}

impl StageState {
    /// Whether `self -> next` is allowed.
    pub fn can_advance(self, next: StageState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Skipped)
                | (Self::Running, Self::Cancelled)
        )
    }

    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Metric label
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label().to_ascii_uppercase())
    }
}

/// Outcome of one stage in one run.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    /// Stage name
    pub name: String,
    /// Final (or current) state
    pub state: StageState,
    /// Copied from the stage metadata
    pub skip_on_fail: bool,
    /// Why the stage was skipped
    pub reason: Option<String>,
    /// Report of a completed stage
    pub report: Option<StageReport>,
    /// Error of a failed stage
    pub error: Option<String>,
    /// Wall time spent running
    pub duration_ms: u64,
}

impl StageRecord {
    fn pending(meta: &SubTaskMeta) -> Self {
        Self {
            name: meta.name.to_string(),
            state: StageState::Pending,
            skip_on_fail: meta.skip_on_fail,
            reason: None,
            report: None,
            error: None,
            duration_ms: 0,
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn advance(&mut self, next: StageState) -> Result<(), RegistryError> {
        if !self.state.can_advance(next) {
            return Err(RegistryError::IllegalTransition {
                stage: self.name.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Whether this record makes the pipeline unsuccessful
    pub fn is_blocking_failure(&self) -> bool {
        self.state == StageState::Failed && !self.skip_on_fail
    }
}

/// Every stage's record, in execution order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    /// Stage records
    pub stages: Vec<StageRecord>,
}

impl PipelineReport {
    /// False iff some stage failed without `skip_on_fail`.
    pub fn is_success(&self) -> bool {
        !self.stages.iter().any(StageRecord::is_blocking_failure)
    }

    /// Whether a stage was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.state == StageState::Cancelled)
    }

    /// Record for `name`
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

/// Progress callbacks, e.g. for a spinner.
#[async_trait]
pub trait StageObserver: Send + Sync {
    /// A stage is about to run.
    async fn stage_started(&self, meta: &SubTaskMeta);

    /// A stage reached a terminal state.
    async fn stage_finished(&self, record: &StageRecord);
}

/// Runs the stages of a registry against one context.
pub struct PipelineRunner<'r> {
    registry: &'r SubTaskRegistry,
    selection: Option<Vec<String>>,
    observer: Option<Arc<dyn StageObserver>>,
}

impl<'r> PipelineRunner<'r> {
    /// Runner for the default-enabled stages of `registry`
    pub fn new(registry: &'r SubTaskRegistry) -> Self {
        Self {
            registry,
            selection: None,
            observer: None,
        }
    }

    /// Run exactly these stages instead of the default-enabled ones.
    pub fn with_selection(mut self, selection: Option<Vec<String>>) -> Self {
        self.selection = selection;
        self
    }

    /// Report progress to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Execute the pipeline.
    ///
    /// Registry problems (unknown selection, cycles) fail before any stage
    /// runs; stage failures are recorded in the report.
    pub async fn run(&self, ctx: &TaskContext) -> Result<PipelineReport, RegistryError> {
        let order = self.registry.execution_order()?;
        let enabled = self.registry.enabled(self.selection.as_deref())?;
        let params = ctx.params_key();

        info!(stages = order.len(), enabled = enabled.len(), "Pipeline started");

        let mut blocked: HashSet<&'static str> = HashSet::new();
        let mut report = PipelineReport::default();

        for meta in order {
            let mut record = StageRecord::pending(meta);

            let skip = if ctx.cancel.is_cancelled() || report.is_cancelled() {
                Some("run cancelled".to_string())
            } else if !enabled.contains(meta.name) {
                Some("not enabled".to_string())
            } else if let Some(table) = meta
                .dependency_tables
                .iter()
                .find(|table| blocked.contains(*table))
            {
                blocked.extend(meta.product_tables.iter().copied());
                Some(format!("dependency table {table} is blocked by a failed stage"))
            } else {
                match has_input(ctx, meta, &params).await {
                    Ok(true) => None,
                    Ok(false) => Some("no data in dependency tables".to_string()),
                    Err(e) => {
                        record.advance(StageState::Running)?;
                        fail(&mut record, meta, &mut blocked, &SubTaskError::Store(e))?;
                        self.finish(&mut report, record).await;
                        continue;
                    }
                }
            };

            if let Some(reason) = skip {
                record.advance(StageState::Skipped)?;
                info!(stage = meta.name, reason = %reason, "Stage skipped");
                record.reason = Some(reason);
                self.finish(&mut report, record).await;
                continue;
            }

            record.advance(StageState::Running)?;
            info!(stage = meta.name, "Stage started");
            if let Some(observer) = &self.observer {
                observer.stage_started(meta).await;
            }

            let mut stage_ctx = ctx.clone();
            let started = Instant::now();
            let result = (meta.entry_point)(&mut stage_ctx)
                .instrument(info_span!("stage", stage = meta.name))
                .await;
            record.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(stage_report) => {
                    record.advance(StageState::Completed)?;
                    info!(
                        stage = meta.name,
                        processed = stage_report.processed,
                        skipped = stage_report.skipped.len(),
                        duration_ms = record.duration_ms,
                        "Stage completed: {}",
                        stage_report.message
                    );
                    record.report = Some(stage_report);
                }
                Err(SubTaskError::Cancelled) => {
                    record.advance(StageState::Cancelled)?;
                    warn!(stage = meta.name, "Stage cancelled");
                }
                Err(e) => fail(&mut record, meta, &mut blocked, &e)?,
            }
            self.finish(&mut report, record).await;
        }

        info!(success = report.is_success(), "Pipeline finished");
        Ok(report)
    }

    async fn finish(&self, report: &mut PipelineReport, record: StageRecord) {
        metrics::record_stage(&record.name, record.state.label());
        if let Some(observer) = &self.observer {
            observer.stage_finished(&record).await;
        }
        report.stages.push(record);
    }
}

fn fail(
    record: &mut StageRecord,
    meta: &SubTaskMeta,
    blocked: &mut HashSet<&'static str>,
    e: &SubTaskError,
) -> Result<(), RegistryError> {
    record.advance(StageState::Failed)?;
    record.error = Some(e.to_string());
    if meta.skip_on_fail {
        warn!(stage = meta.name, error = %e, "Stage failed; dependents still run");
    } else {
        error!(stage = meta.name, error = %e, "Stage failed");
        blocked.extend(meta.product_tables.iter().copied());
    }
    Ok(())
}

/// Whether any dependency table holds data for these params. Stages without
/// dependency tables always have input.
async fn has_input(
    ctx: &TaskContext,
    meta: &SubTaskMeta,
    params: &str,
) -> Result<bool, crate::store::StoreError> {
    if meta.dependency_tables.is_empty() {
        return Ok(true);
    }
    for table in meta.dependency_tables {
        if ctx.raw.has_data(table, params).await? || ctx.entities.count(table, params).await? > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}
