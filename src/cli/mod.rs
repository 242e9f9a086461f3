//! meterlink CLI - unified command-line interface.
//!
//! Provides a single binary entry point for:
//! - `meterlink start` - Run the delivery agent
//! - `meterlink certs` - Report certificate provisioning
//! - `meterlink reconcile` - One-shot boot reconciliation

mod args;
pub mod commands;

pub use args::{Cli, Commands, ConfigArgs, OutputFormat, ReportArgs};
