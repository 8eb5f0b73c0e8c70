//! Keystone - unified CLI entrypoint.
//!
//! Usage:
//!   keystone start --config config/keystone.toml
//!   keystone config validate --config config/keystone.toml
//!   keystone config show --format json
//!   keystone inspect message <hex>
//!   keystone inspect truncate-log data/truncate.json

use anyhow::Result;
use clap::Parser;
use keystone::cli::commands::{run_config, run_inspect, run_start};
use keystone::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/keystone.toml"));

    match cli.command {
        Commands::Start(args) => run_start(args, &config_path, cli.log_level).await,
        Commands::Config(args) => run_config(args, &config_path),
        Commands::Inspect(args) => run_inspect(args),
    }
}
