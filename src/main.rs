//! meterlink - unified CLI entrypoint.
//!
//! Usage:
//!   meterlink start --config config/meterlink.toml
//!   meterlink certs [--format json]
//!   meterlink reconcile [--format json]

use anyhow::Result;
use clap::Parser;
use meterlink::cli::commands::{run_certs, run_reconcile, run_start};
use meterlink::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Certs(args) => run_certs(args),
        Commands::Reconcile(args) => run_reconcile(args),
    }
}
