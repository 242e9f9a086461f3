//! Start command - runs the delivery agent.

use super::load_config;
use crate::cli::args::ConfigArgs;
use crate::runtime::Runtime;
use crate::telemetry;
use anyhow::Result;

pub async fn run_start(args: ConfigArgs) -> Result<()> {
    let config = load_config(&args)?;
    let log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    let mut runtime = Runtime::new(config, Some(log_handle))?;
    runtime.run().await
}
