//! Data source integrations.

pub mod github;

use crate::subtask::{RegistryError, SubTaskRegistry};

/// Registry with every built-in stage.
pub fn default_registry() -> Result<SubTaskRegistry, RegistryError> {
    let mut registry = SubTaskRegistry::new();
    github::register(&mut registry)?;
    Ok(registry)
}
