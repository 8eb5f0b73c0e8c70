//! Command-line interface.
//!
//! Unified CLI for Keystone operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Keystone - write-path coordination core for a clustered key-value node.
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a Keystone node.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Decode peer messages and truncate logs.
    Inspect(commands::InspectArgs),
}
