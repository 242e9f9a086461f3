//! CLI command implementations.

mod certs;
mod reconcile;
mod start;

pub use certs::run_certs;
pub use reconcile::run_reconcile;
pub use start::run_start;

use crate::cli::args::ConfigArgs;
use crate::config::Config;
use anyhow::Result;

/// `--config` wins over METERLINK_CONFIG; overrides apply either way.
pub(crate) fn load_config(args: &ConfigArgs) -> Result<Config> {
    let config = match &args.config {
        Some(path) => Config::load_with_overrides(path)?,
        None => Config::load_from_env()?,
    };
    config.validate()?;
    Ok(config)
}
