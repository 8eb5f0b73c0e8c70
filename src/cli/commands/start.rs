//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start a Keystone node.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override the node id from the config file.
    #[arg(long)]
    pub node_id: Option<u64>,

    /// Override the storage directory from the config file.
    #[arg(long)]
    pub storage_dir: Option<String>,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Load `config_path`, apply overrides and run until shutdown.
pub async fn run_start(
    args: StartArgs,
    config_path: &Path,
    log_level: Option<String>,
) -> Result<()> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        storage_dir: args.storage_dir,
        node_id: args.node_id,
    });
    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
