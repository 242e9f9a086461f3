//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// meterlink - telemetry delivery agent for metering kiosks.
#[derive(Parser)]
#[command(name = "meterlink")]
#[command(version)]
#[command(about = "Meter telemetry delivery agent and diagnostic tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile household state, then run the delivery worker until signalled
    Start(ConfigArgs),

    /// Check that the broker certificates for this device are provisioned
    Certs(ReportArgs),

    /// Run the boot-time household reconciliation once and exit
    Reconcile(ReportArgs),
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Path to configuration file (defaults to $METERLINK_CONFIG, then config/meterlink.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct ReportArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Output format for the report
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Output format for diagnostic commands.
#[derive(clap::ValueEnum, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// A single JSON object
    Json,
}
