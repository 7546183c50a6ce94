//! CLI error types and conversions

use crate::collector::TransportError;
use crate::store::StoreError;
use crate::subtask::RegistryError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Stage registration, selection, or ordering failed
    #[error("registry error: {0}")]
    RegistryError(#[from] RegistryError),

    /// The data directory could not be opened
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    /// The HTTP client could not be built
    #[error("transport error: {0}")]
    TransportError(#[from] TransportError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Result could not be rendered
    #[error("output error: {0}")]
    OutputError(String),

    /// At least one stage failed without `skip_on_fail`
    #[error("pipeline failed: {}", .0.join(", "))]
    PipelineFailed(Vec<String>),
}
