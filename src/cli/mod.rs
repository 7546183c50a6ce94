//! CLI command implementations

pub mod error;
pub mod run;
pub mod stages;

pub use error::CliError;
pub use run::RunArgs;
pub use stages::StagesCommand;

use clap::{Parser, Subcommand, ValueEnum};

/// Stateful collector CLI
#[derive(Parser, Debug)]
#[command(name = "stateful-collector")]
#[command(about = "Collect paginated API data into an idempotent raw store", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    pub output_format: OutputFormat,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the collection pipeline for one repository
    Run(RunArgs),

    /// List registered stages in execution order
    Stages(StagesCommand),
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

/// Print `value` as one JSON document on stdout.
fn print_json(value: &serde_json::Value) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|e| CliError::OutputError(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}
