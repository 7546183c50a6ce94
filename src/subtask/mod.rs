//! Collection stages and the pipeline that sequences them.
//!
//! A stage is a [`SubTaskMeta`]: static metadata plus an entry point taking a
//! [`TaskContext`]. Stages are registered into an explicit
//! [`SubTaskRegistry`] at startup and executed in dependency order by the
//! [`PipelineRunner`].

pub mod registry;
pub mod runner;

pub use registry::{RegistryError, SubTaskRegistry};
pub use runner::{PipelineReport, PipelineRunner, StageObserver, StageRecord, StageState};

use crate::collector::{
    ApiClient, CollectionOutcome, CollectionSummary, CollectorError, CollectorSettings, ItemFailure,
};
use crate::shutdown::{Cancellation, SharedCancellation};
use crate::store::{EntityStore, RawDataStore, StoreError};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Stage entry point.
pub type EntryPoint =
    for<'a> fn(&'a mut TaskContext) -> BoxFuture<'a, Result<StageReport, SubTaskError>>;

/// Immutable stage descriptor.
#[derive(Clone, Copy)]
pub struct SubTaskMeta {
    /// Unique stage name
    pub name: &'static str,
    /// One-line description
    pub description: &'static str,
    /// Code to run
    pub entry_point: EntryPoint,
    /// Runs unless an explicit selection says otherwise
    pub enabled_by_default: bool,
    /// Domain/category tags
    pub domain_types: &'static [&'static str],
    /// Tables read
    pub dependency_tables: &'static [&'static str],
    /// Tables written
    pub product_tables: &'static [&'static str],
    /// Failure does not block dependents
    pub skip_on_fail: bool,
}

impl SubTaskMeta {
    /// Whether this stage reads any table `other` writes.
    pub fn depends_on(&self, other: &SubTaskMeta) -> bool {
        self.dependency_tables
            .iter()
            .any(|table| other.product_tables.contains(table))
    }
}

impl fmt::Debug for SubTaskMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubTaskMeta")
            .field("name", &self.name)
            .field("enabled_by_default", &self.enabled_by_default)
            .field("domain_types", &self.domain_types)
            .field("dependency_tables", &self.dependency_tables)
            .field("product_tables", &self.product_tables)
            .field("skip_on_fail", &self.skip_on_fail)
            .finish()
    }
}

/// Errors a stage entry point returns.
#[derive(Debug, thiserror::Error)]
pub enum SubTaskError {
    /// The collector ended with a fatal error
    #[error(transparent)]
    Collector(#[from] CollectorError),

    /// A store operation outside the collector failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The run was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Too many items were skipped
    #[error("skip ratio {ratio:.2} exceeds limit {max:.2} ({skipped} items skipped)")]
    SkipThreshold {
        /// Observed ratio
        ratio: f64,
        /// Configured limit
        max: f64,
        /// Skipped item count
        skipped: usize,
    },

    /// A task option had the wrong shape
    #[error("invalid task option {key}: {message}")]
    InvalidOption {
        /// Option name
        key: String,
        /// Decoder message
        message: String,
    },

    /// Raw data could not be turned into rows
    #[error("extraction failed: {0}")]
    Extraction(String),
}

/// What a completed stage reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageReport {
    /// Items processed (inputs collected or records extracted)
    pub processed: u64,
    /// Items excluded by failure isolation
    pub skipped: Vec<ItemFailure>,
    /// Whether some data was left behind
    pub partial: bool,
    /// Completion message
    pub message: String,
}

impl StageReport {
    /// Report with only a message
    pub fn with_message(processed: u64, message: impl Into<String>) -> Self {
        Self {
            processed,
            message: message.into(),
            ..Self::default()
        }
    }

    /// Turn a collector summary into a stage result.
    ///
    /// Fatal outcomes and cancellation become errors; item skips stay in the
    /// report unless they exceed `max_skip_ratio`.
    pub fn from_collection(
        summary: CollectionSummary,
        max_skip_ratio: Option<f64>,
    ) -> Result<Self, SubTaskError> {
        let message = summary.message();
        let ratio = summary.skip_ratio();
        match summary.outcome {
            CollectionOutcome::Failed(e) => return Err(e.into()),
            CollectionOutcome::Cancelled => return Err(SubTaskError::Cancelled),
            CollectionOutcome::Completed => {}
        }
        if let Some(max) = max_skip_ratio {
            if ratio > max {
                return Err(SubTaskError::SkipThreshold {
                    ratio,
                    max,
                    skipped: summary.skipped.len(),
                });
            }
        }
        Ok(Self {
            processed: summary.processed,
            partial: !summary.skipped.is_empty(),
            skipped: summary.skipped,
            message,
        })
    }
}

/// Per-stage execution handle.
///
/// The runner hands every stage its own clone, so options a stage sets never
/// leak into another stage.
#[derive(Clone)]
pub struct TaskContext {
    /// Raw page store
    pub raw: Arc<dyn RawDataStore>,
    /// Entity tables
    pub entities: Arc<dyn EntityStore>,
    /// Authenticated upstream client
    pub client: Arc<dyn ApiClient>,
    /// Cancellation signal shared with the runner
    pub cancel: SharedCancellation,
    /// Collector settings for collection stages
    pub settings: CollectorSettings,
    params: Value,
    options: Map<String, Value>,
}

impl TaskContext {
    /// Context for the connection/entity selector `params`.
    pub fn new(
        raw: Arc<dyn RawDataStore>,
        entities: Arc<dyn EntityStore>,
        client: Arc<dyn ApiClient>,
        params: Value,
    ) -> Self {
        Self {
            raw,
            entities,
            client,
            cancel: Cancellation::shared(),
            settings: CollectorSettings::default(),
            params,
            options: Map::new(),
        }
    }

    /// Share `cancel` with every stage.
    pub fn with_cancellation(mut self, cancel: SharedCancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the collector settings.
    pub fn with_settings(mut self, settings: CollectorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set a task option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.set_option(key, value);
        self
    }

    /// Connection/entity selector
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Canonical params string
    pub fn params_key(&self) -> String {
        crate::collector::executor::params_key(&self.params)
    }

    /// Set (or with `null`, clear) a task option.
    pub fn set_option(&mut self, key: impl Into<String>, value: impl Serialize) {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(Value::Null) | Err(_) => {
                self.options.remove(&key);
            }
            Ok(value) => {
                self.options.insert(key, value);
            }
        }
    }

    /// Typed task option; `Ok(None)` when absent.
    pub fn option<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SubTaskError> {
        self.options
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| SubTaskError::InvalidOption {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Boolean option with a default.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool, SubTaskError> {
        Ok(self.option(key)?.unwrap_or(default))
    }
}
