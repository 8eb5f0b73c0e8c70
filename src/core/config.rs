//! Configuration parsing and validation.
//!
//! Keystone configuration is loaded from TOML files with CLI overrides.
//! Namespaces are listed in order; a namespace's position in the list is
//! its namespace index on the wire.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level Keystone configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and local paths.
    pub node: NodeConfig,

    /// Transaction coordination tuning.
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Truncation reaper configuration.
    #[serde(default)]
    pub truncate: TruncateConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Namespaces served by this node.
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,
}

/// Node identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identifier. Must be non-zero.
    pub node_id: u64,

    /// Directory holding the persisted truncation log.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
}

/// Transaction coordination tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Base retransmit interval in milliseconds (doubles per attempt).
    #[serde(default = "default_retransmit_ms")]
    pub retransmit_ms: u64,

    /// Maximum retransmissions per destination before failing.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Hard deadline for a whole transaction in milliseconds.
    #[serde(default = "default_transaction_max_ms")]
    pub transaction_max_ms: u64,

    /// Number of single-flight registry shards. Must be a power of two.
    #[serde(default = "default_registry_shards")]
    pub registry_shards: usize,

    /// Maximum times a transaction restarts duplicate resolution.
    #[serde(default = "default_max_reresolves")]
    pub max_reresolves: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            retransmit_ms: default_retransmit_ms(),
            max_retries: default_max_retries(),
            transaction_max_ms: default_transaction_max_ms(),
            registry_shards: default_registry_shards(),
            max_reresolves: default_max_reresolves(),
        }
    }
}

/// Truncation reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncateConfig {
    /// Worker threads started per truncation pass.
    #[serde(default = "default_truncate_threads")]
    pub threads: u32,
    /// Reaper threads allowed to run at once across all namespaces.
    #[serde(default = "default_truncate_max_threads")]
    pub max_threads: u32,
}

impl Default for TruncateConfig {
    fn default() -> Self {
        Self {
            threads: default_truncate_threads(),
            max_threads: default_truncate_max_threads(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// When the client is answered relative to replica acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitLevel {
    /// Hold the client until every replica acknowledged.
    All,
    /// Answer once the master's local write is durable.
    Master,
}

/// Rule replicas use to accept or refuse an inbound replica write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolutionPolicy {
    /// Higher generation wins, LUT breaks ties.
    Generation,
    /// Higher LUT wins, generation breaks ties.
    LastUpdateTime,
}

/// Secondary key for duplicate resolution when LUTs tie exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Higher generation wins, then higher node id.
    Generation,
    /// Higher node id wins.
    NodeId,
}

/// Per-namespace policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace name.
    pub name: String,

    /// Copies of each record, master included.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,

    /// Default commit level for writes.
    #[serde(default = "default_commit_level")]
    pub write_commit_level: CommitLevel,

    /// Replica-side conflict resolution rule.
    #[serde(default = "default_conflict_resolution_policy")]
    pub conflict_resolution_policy: ConflictResolutionPolicy,

    /// Duplicate-resolution tie-break key.
    #[serde(default = "default_tie_break")]
    pub dup_res_tie_break: TieBreak,

    /// TTL applied when a write asks for the namespace default, in seconds.
    #[serde(default)]
    pub default_ttl: u32,

    /// Expiration sweep period in seconds. Zero disables the sweep.
    #[serde(default = "default_nsup_period")]
    pub nsup_period: u32,

    /// Permit positive TTLs even with no expiration sweep.
    #[serde(default)]
    pub allow_ttl_without_nsup: bool,

    /// Reachable replica destinations required before a write is sent.
    #[serde(default)]
    pub required_replicas: u32,

    /// Exchange an explicit confirmation after replica acknowledgments.
    #[serde(default)]
    pub confirm_replica_writes: bool,

    /// Keep per-bin LUTs so duplicates can be merged bin by bin.
    #[serde(default)]
    pub bin_convergence: bool,
}

impl NamespaceConfig {
    /// Namespace with default policy.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replication_factor: default_replication_factor(),
            write_commit_level: default_commit_level(),
            conflict_resolution_policy: default_conflict_resolution_policy(),
            dup_res_tie_break: default_tie_break(),
            default_ttl: 0,
            nsup_period: default_nsup_period(),
            allow_ttl_without_nsup: false,
            required_replicas: 0,
            confirm_replica_writes: false,
            bin_convergence: false,
        }
    }
}

/// Longest namespace name accepted.
pub const MAX_NAMESPACE_NAME_LEN: usize = 31;

/// Upper bound on the replication factor.
pub const MAX_REPLICATION_FACTOR: u32 = 128;

// Default value functions

fn default_storage_dir() -> String {
    "data".to_string()
}

fn default_retransmit_ms() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_transaction_max_ms() -> u64 {
    30_000
}

fn default_registry_shards() -> usize {
    256
}

fn default_max_reresolves() -> u32 {
    3
}

fn default_truncate_threads() -> u32 {
    4
}

fn default_truncate_max_threads() -> u32 {
    crate::truncate::MAX_TRUNCATE_THREADS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_replication_factor() -> u32 {
    2
}

fn default_commit_level() -> CommitLevel {
    CommitLevel::All
}

fn default_conflict_resolution_policy() -> ConflictResolutionPolicy {
    ConflictResolutionPolicy::Generation
}

fn default_tie_break() -> TieBreak {
    TieBreak::Generation
}

fn default_nsup_period() -> u32 {
    120
}

impl Config {
    /// Configuration with default tuning for `node_id` serving `namespaces`.
    pub fn new(node_id: u64, namespaces: Vec<NamespaceConfig>) -> Self {
        Self {
            node: NodeConfig {
                node_id,
                storage_dir: default_storage_dir(),
            },
            transaction: TransactionConfig::default(),
            truncate: TruncateConfig::default(),
            telemetry: TelemetryConfig::default(),
            namespaces,
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a namespace by name, returning its index and policy.
    pub fn namespace(&self, name: &str) -> Option<(u32, &NamespaceConfig)> {
        self.namespaces
            .iter()
            .enumerate()
            .find(|(_, ns)| ns.name == name)
            .map(|(ix, ns)| (ix as u32, ns))
    }

    /// Look up a namespace by index.
    pub fn namespace_at(&self, ns_index: u32) -> Option<&NamespaceConfig> {
        self.namespaces.get(ns_index as usize)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref storage_dir) = overrides.storage_dir {
            self.node.storage_dir = storage_dir.clone();
        }
        if let Some(node_id) = overrides.node_id {
            self.node.node_id = node_id;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_node()?;
        self.validate_transaction()?;
        self.validate_truncate()?;
        self.validate_telemetry()?;
        self.validate_namespaces()?;
        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        if self.node.node_id == 0 {
            anyhow::bail!("node.node_id must be > 0");
        }
        Ok(())
    }

    fn validate_transaction(&self) -> Result<()> {
        if self.transaction.retransmit_ms == 0 {
            anyhow::bail!("transaction.retransmit_ms must be > 0");
        }
        if self.transaction.transaction_max_ms < self.transaction.retransmit_ms {
            anyhow::bail!(
                "transaction.transaction_max_ms ({}) cannot be below retransmit_ms ({})",
                self.transaction.transaction_max_ms,
                self.transaction.retransmit_ms
            );
        }
        let shards = self.transaction.registry_shards;
        if shards == 0 || !shards.is_power_of_two() {
            anyhow::bail!(
                "transaction.registry_shards must be a power of two, got: {}",
                shards
            );
        }
        Ok(())
    }

    fn validate_truncate(&self) -> Result<()> {
        let max = crate::truncate::MAX_TRUNCATE_THREADS;
        if self.truncate.threads == 0 || self.truncate.threads > max {
            anyhow::bail!(
                "truncate.threads must be between 1 and {}, got: {}",
                max,
                self.truncate.threads
            );
        }
        if self.truncate.max_threads == 0 || self.truncate.max_threads > max {
            anyhow::bail!(
                "truncate.max_threads must be between 1 and {}, got: {}",
                max,
                self.truncate.max_threads
            );
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    fn validate_namespaces(&self) -> Result<()> {
        if self.namespaces.is_empty() {
            anyhow::bail!("at least one [[namespaces]] entry is required");
        }
        let mut seen = std::collections::HashSet::new();
        for ns in &self.namespaces {
            if ns.name.is_empty() || ns.name.len() > MAX_NAMESPACE_NAME_LEN {
                anyhow::bail!(
                    "namespace name must be 1-{} bytes, got: {:?}",
                    MAX_NAMESPACE_NAME_LEN,
                    ns.name
                );
            }
            if !seen.insert(ns.name.as_str()) {
                anyhow::bail!("duplicate namespace: {}", ns.name);
            }
            if ns.replication_factor == 0 || ns.replication_factor > MAX_REPLICATION_FACTOR {
                anyhow::bail!(
                    "namespace {}: replication_factor must be between 1 and {}",
                    ns.name,
                    MAX_REPLICATION_FACTOR
                );
            }
            if ns.required_replicas >= ns.replication_factor {
                anyhow::bail!(
                    "namespace {}: required_replicas ({}) must be below replication_factor ({})",
                    ns.name,
                    ns.required_replicas,
                    ns.replication_factor
                );
            }
            if ns.default_ttl > crate::rw::policy::MAX_ALLOWED_TTL {
                anyhow::bail!(
                    "namespace {}: default_ttl ({}) exceeds the maximum {}",
                    ns.name,
                    ns.default_ttl,
                    crate::rw::policy::MAX_ALLOWED_TTL
                );
            }
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override storage directory.
    pub storage_dir: Option<String>,
    /// Override node id.
    pub node_id: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[node]
node_id = 7

[[namespaces]]
name = "test"
"#;

    #[test]
    fn minimal_config_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.node.node_id, 7);
        assert_eq!(config.transaction.registry_shards, 256);
        let (ix, ns) = config.namespace("test").unwrap();
        assert_eq!(ix, 0);
        assert_eq!(ns.replication_factor, 2);
        assert_eq!(ns.write_commit_level, CommitLevel::All);
        assert_eq!(ns.dup_res_tie_break, TieBreak::Generation);
    }

    #[test]
    fn kebab_case_enums_parse() {
        let config = Config::from_toml(
            r#"
[node]
node_id = 1

[[namespaces]]
name = "bar"
write_commit_level = "master"
conflict_resolution_policy = "last-update-time"
dup_res_tie_break = "node-id"
"#,
        )
        .unwrap();
        let ns = config.namespace_at(0).unwrap();
        assert_eq!(ns.write_commit_level, CommitLevel::Master);
        assert_eq!(
            ns.conflict_resolution_policy,
            ConflictResolutionPolicy::LastUpdateTime
        );
        assert_eq!(ns.dup_res_tie_break, TieBreak::NodeId);
    }

    #[test]
    fn rejects_non_power_of_two_shards() {
        let err = Config::from_toml(
            r#"
[node]
node_id = 1

[transaction]
registry_shards = 100
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("registry_shards"));
    }

    #[test]
    fn rejects_duplicate_namespace() {
        let err = Config::from_toml(
            r#"
[node]
node_id = 1

[[namespaces]]
name = "a"

[[namespaces]]
name = "a"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate namespace"));
    }

    #[test]
    fn overrides_apply() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.apply_overrides(&ConfigOverrides {
            log_level: Some("debug".to_string()),
            storage_dir: Some("/tmp/ks".to_string()),
            node_id: Some(9),
        });
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.node.storage_dir, "/tmp/ks");
        assert_eq!(config.node.node_id, 9);
    }
}
