//! Reconcile command - one-shot boot reconciliation without starting delivery.

use super::load_config;
use crate::cli::args::{OutputFormat, ReportArgs};
use crate::household::reconcile::BootOutcome;
use crate::runtime::Runtime;
use crate::telemetry;
use anyhow::Result;
use serde_json::json;

pub fn run_reconcile(args: ReportArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    if config.delivery.spool_path.is_none() {
        tracing::warn!("no delivery.spool_path configured; queued events will not outlive this run");
    }
    let runtime = Runtime::new(config, None)?;
    let outcome = runtime.reconcile();
    let queued = runtime.queue().len();

    let (fresh, discarded, announced) = match outcome {
        BootOutcome::ProcessRestart => (false, 0, 0),
        BootOutcome::FreshBoot {
            discarded,
            announced,
        } => (true, discarded, announced),
    };
    match args.format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "device_id": runtime.device_id(),
                "fresh_boot": fresh,
                "discarded": discarded,
                "announced": announced,
                "queued": queued,
            })
        ),
        OutputFormat::Text => {
            if fresh {
                println!("Fresh boot: discarded {discarded}, announced {announced}");
            } else {
                println!("Process restart: queue untouched");
            }
            println!("Queued events: {queued}");
        }
    }
    Ok(())
}
