//! GitHub Actions payloads and row types.
//!
//! Only the fields the stages need are modelled; everything else in the
//! upstream payloads is ignored on decode and remains available in the raw
//! tables.

use crate::collector::CollectorInput;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Connection and repository selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubParams {
    /// Connection id
    pub connection_id: u64,
    /// Repository full name (`owner/repo`)
    pub name: String,
}

impl GithubParams {
    /// Params object for `TaskContext` and raw keys.
    pub fn to_value(&self) -> Value {
        json!({
            "connection_id": self.connection_id,
            "name": self.name,
        })
    }
}

/// Workflow run as stored in `github_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubRun {
    /// Run id
    pub id: i64,
    /// Workflow name
    #[serde(default)]
    pub name: Option<String>,
    /// Branch the run was triggered on
    #[serde(default)]
    pub head_branch: Option<String>,
    /// Commit sha
    #[serde(default)]
    pub head_sha: Option<String>,
    /// Trigger event
    #[serde(default)]
    pub event: Option<String>,
    /// queued, in_progress, completed
    #[serde(default)]
    pub status: Option<String>,
    /// success, failure, cancelled, ...
    #[serde(default)]
    pub conclusion: Option<String>,
    /// Run number within the workflow
    #[serde(default)]
    pub run_number: Option<i64>,
    /// Web URL
    #[serde(default)]
    pub html_url: Option<String>,
    /// Creation time
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update; drives incremental job collection
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The part of a run that drives job collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRef {
    /// Run id
    pub id: i64,
    /// Run's last update
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CollectorInput for RunRef {
    fn identity(&self) -> String {
        self.id.to_string()
    }
}

/// Workflow job as stored in `github_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubJob {
    /// Job id
    pub id: i64,
    /// Owning run
    pub run_id: i64,
    /// Job name
    #[serde(default)]
    pub name: Option<String>,
    /// queued, in_progress, completed
    #[serde(default)]
    pub status: Option<String>,
    /// success, failure, skipped, ...
    #[serde(default)]
    pub conclusion: Option<String>,
    /// Web URL
    #[serde(default)]
    pub html_url: Option<String>,
    /// Runner that picked the job up
    #[serde(default)]
    pub runner_name: Option<String>,
    /// Start time; absent when upstream sends a zero timestamp
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time; absent when upstream sends a zero timestamp
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Drop placeholder timestamps (year 0 or 1) that some payloads use for
/// "not set".
pub fn non_zero_time(time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (time.year() > 1).then_some(time)
}

/// Parse an RFC 3339 timestamp, treating placeholders and garbage as absent.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .and_then(non_zero_time)
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}
