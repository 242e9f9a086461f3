//! Certs command - reports which broker credentials are provisioned.

use super::load_config;
use crate::cli::args::{OutputFormat, ReportArgs};
use crate::delivery::tls;
use anyhow::{bail, Result};
use serde_json::json;

pub fn run_certs(args: ReportArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let device_id = config.resolve_device_id();
    let resolver = config.resolver_for(&device_id);
    let expected = resolver.expected();

    let (missing, tls_error) = match resolver.resolve() {
        Ok(paths) => (
            Vec::new(),
            tls::build_client_config(&paths)
                .err()
                .map(|err| format!("{err:#}")),
        ),
        Err(missing) => (missing.missing, None),
    };

    match args.format {
        OutputFormat::Json => {
            let report = json!({
                "device_id": device_id,
                "key": expected.key,
                "chain": expected.chain,
                "ca": expected.ca,
                "missing": missing
                    .iter()
                    .map(|m| json!({"artifact": m.artifact.to_string(), "path": m.path}))
                    .collect::<Vec<_>>(),
                "tls_error": tls_error,
            });
            println!("{report}");
        }
        OutputFormat::Text => {
            println!("Device: {}", device_id);
            println!("Key: {}", expected.key.display());
            println!("Chain: {}", expected.chain.display());
            println!("CA: {}", expected.ca.display());
            for item in &missing {
                println!("MISSING {}", item);
            }
            if let Some(err) = &tls_error {
                println!("TLS config invalid: {}", err);
            }
        }
    }

    if !missing.is_empty() {
        bail!("{} certificate artifact(s) missing", missing.len());
    }
    if tls_error.is_some() {
        bail!("certificates present but unusable");
    }
    if args.format == OutputFormat::Text {
        println!("OK");
    }
    Ok(())
}
