//! # xenmgr
//!
//! Operator CLI for the Xen lifecycle controller. It plays the part of the
//! sandbox orchestrator: it reads the machine table from the configuration
//! file and runs one lifecycle operation per invocation.
//!
//! ## Usage
//! ```bash
//! xenmgr --config /etc/xenmgr/xenmgr.yaml start win7
//! xenmgr list --json
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod commands;
mod config;

use cli::Args;
use config::{Config, DEFAULT_CONFIG_PATH};
use xenmgr_common::LogFormat;

/// Resolve the configuration before logging is up; report how it was found
/// once it is.
fn load_config(args: &Args) -> Result<(Config, String)> {
    match &args.config {
        // Explicit config file provided
        Some(path) => {
            let config = Config::load(path)?;
            Ok((config, format!("loaded from {}", path.display())))
        }
        // Try default location, fall back to CLI-only config
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(config) => Ok((config, format!("loaded from {}", DEFAULT_CONFIG_PATH))),
            Err(_) => Ok((Config::default(), "defaults".to_string())),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    let (config, source) = load_config(&args)?;
    let config = config.with_cli_overrides(&args);

    // Initialize logging
    let format = if config.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    format.init(&config.logging.level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %source,
        xm_path = %config.xen.xm_path.display(),
        machines = config.machines.len(),
        "Starting xenmgr"
    );

    let manager = commands::build_manager(&config, args.dev)?;

    let mut stdout = std::io::stdout();
    if let Err(e) = commands::run(&args.command, &config, &manager, &mut stdout).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }

    Ok(())
}
