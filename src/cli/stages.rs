//! `stages` command: list registered stages.

use super::{print_json, CliError, OutputFormat};
use crate::plugins::default_registry;
use crate::subtask::SubTaskMeta;
use clap::Args;
use serde_json::{json, Value};

/// Arguments of the `stages` command
#[derive(Debug, Args)]
pub struct StagesCommand {
    /// Only list stages enabled by default
    #[arg(long, default_value_t = false)]
    pub enabled_only: bool,
}

fn describe(meta: &SubTaskMeta) -> Value {
    json!({
        "name": meta.name,
        "description": meta.description,
        "enabled_by_default": meta.enabled_by_default,
        "domain_types": meta.domain_types,
        "dependency_tables": meta.dependency_tables,
        "product_tables": meta.product_tables,
        "skip_on_fail": meta.skip_on_fail,
    })
}

impl StagesCommand {
    /// Print stages in execution order.
    pub fn execute(&self, format: OutputFormat) -> Result<(), CliError> {
        let registry = default_registry()?;
        let stages: Vec<&SubTaskMeta> = registry
            .execution_order()?
            .into_iter()
            .filter(|meta| !self.enabled_only || meta.enabled_by_default)
            .collect();

        match format {
            OutputFormat::Json => {
                print_json(&Value::Array(stages.iter().map(|meta| describe(meta)).collect()))
            }
            OutputFormat::Human => {
                println!("\nRegistered stages ({}):", stages.len());
                for (i, meta) in stages.iter().enumerate() {
                    let flags = match (meta.enabled_by_default, meta.skip_on_fail) {
                        (true, true) => "enabled, skip-on-fail",
                        (true, false) => "enabled",
                        (false, true) => "disabled, skip-on-fail",
                        (false, false) => "disabled",
                    };
                    println!("  {}. {} [{flags}]", i + 1, meta.name);
                    println!("     {}", meta.description);
                    println!(
                        "     reads: {}  writes: {}",
                        list(meta.dependency_tables),
                        list(meta.product_tables)
                    );
                }
                Ok(())
            }
        }
    }
}

fn list(tables: &[&str]) -> String {
    if tables.is_empty() {
        "-".to_string()
    } else {
        tables.join(", ")
    }
}
