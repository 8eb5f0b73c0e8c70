//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Output format for `config show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShowFormat {
    Toml,
    Json,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate,
    /// Print configuration with defaults filled in.
    Show {
        /// Output format.
        #[arg(long, value_enum, default_value = "toml")]
        format: ShowFormat,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command against `config_path`.
pub fn run_config(args: ConfigArgs, config_path: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => {
            let config = load(config_path)?;
            println!("✓ {} is valid", config_path.display());
            for (ix, ns) in config.namespaces.iter().enumerate() {
                println!(
                    "  namespace {} (index {}): rf={} commit={:?} tie-break={:?}",
                    ns.name, ix, ns.replication_factor, ns.write_commit_level, ns.dup_res_tie_break
                );
            }
            Ok(())
        }
        ConfigCommand::Show { format } => {
            let config = load(config_path)?;
            println!("{}", render(&config, format)?);
            Ok(())
        }
        ConfigCommand::Generate { output } => {
            let template = template();
            match output {
                Some(path) => {
                    std::fs::write(&path, template)
                        .with_context(|| format!("failed to write {:?}", path))?;
                    println!("Generated config template: {:?}", path);
                }
                None => println!("{}", template),
            }
            Ok(())
        }
    }
}

fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    Config::from_file(path)
}

fn render(config: &Config, format: ShowFormat) -> Result<String> {
    Ok(match format {
        ShowFormat::Json => serde_json::to_string_pretty(config)?,
        ShowFormat::Toml => toml::to_string_pretty(config)?,
    })
}

fn template() -> &'static str {
    r#"# Keystone node configuration

[node]
node_id = 1
storage_dir = "data"

[transaction]
retransmit_ms = 1000
max_retries = 5
transaction_max_ms = 30000
registry_shards = 256
max_reresolves = 3

[truncate]
threads = 4

[telemetry]
log_level = "info"

[[namespaces]]
name = "test"
replication_factor = 2
write_commit_level = "all"
conflict_resolution_policy = "generation"
dup_res_tie_break = "generation"
default_ttl = 0
nsup_period = 120
"#
}
