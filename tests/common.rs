//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use bytes::Bytes;
use keystone::cluster::memory::{CountingSindex, MemStore, QueueTransport, StaticPartitionMap};
use keystone::cluster::{NodeId, RecordStore, ReplicaSet};
use keystone::core::config::{Config, NamespaceConfig};
use keystone::core::time::ManualClock;
use keystone::observability::KeystoneMetrics;
use keystone::record::{Digest, Record, RequestKey};
use keystone::rw::{Admission, Coordinator, CoordinatorDeps, WriteRequest, WriteResponse};
use keystone::truncate::TruncationRegistry;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Clock value every harness starts at (citrusleaf-epoch ms).
pub const START_MS: u64 = 1_000_000;

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    write_config(
        r#"
[node]
node_id = 1

[[namespaces]]
name = "test"
"#,
    )
}

/// Create a configuration file storing state under `storage_dir`.
pub fn create_config_with_paths(storage_dir: &str) -> NamedTempFile {
    write_config(&format!(
        r#"
[node]
node_id = 1
storage_dir = "{}"

[[namespaces]]
name = "test"

[[namespaces]]
name = "bar"
replication_factor = 1
"#,
        storage_dir
    ))
}

/// Write `content` to a temp file.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load a config from a temp file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

/// Create a temporary directory for test data.
pub fn temp_test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Digest filled with `seed`.
pub fn digest(seed: u8) -> Digest {
    Digest([seed; 20])
}

/// Id and client handle of an admitted transaction.
#[track_caller]
pub fn admitted(admission: Admission) -> (keystone::rw::RequestId, PendingResponse) {
    match admission {
        Admission::Inserted { id, response } => (id, PendingResponse(response)),
        Admission::AlreadyInFlight { existing } => {
            panic!("expected admission, key busy with {}", existing)
        }
    }
}

/// Client side of a transaction.
pub struct PendingResponse(tokio::sync::oneshot::Receiver<WriteResponse>);

impl PendingResponse {
    /// Response delivered so far.
    pub fn try_take(&mut self) -> Option<WriteResponse> {
        self.0.try_recv().ok()
    }

    /// Response that must already have been delivered.
    #[track_caller]
    pub fn expect(&mut self) -> WriteResponse {
        self.try_take().expect("transaction has not answered")
    }
}

/// Assert that a result is Ok and return the value.
#[track_caller]
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert that a result is Err.
#[track_caller]
pub fn assert_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
        Err(e) => e,
    }
}

// ============================================================================
// In-process cluster
// ============================================================================

/// One node of a [`TestCluster`].
pub struct TestNode {
    pub id: NodeId,
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<MemStore>,
    pub transport: Arc<QueueTransport>,
    pub sindex: Arc<CountingSindex>,
    pub partitions: Arc<StaticPartitionMap>,
    pub truncation: Arc<TruncationRegistry>,
    pub metrics: Arc<KeystoneMetrics>,
}

impl TestNode {
    /// Stored copy of `digest` in namespace 0.
    pub fn record(&self, digest: Digest) -> Option<Record> {
        self.store
            .read(&RequestKey::new(0, digest))
            .expect("store read")
    }
}

/// Coordinators wired together through queued transports. Node ids are
/// `1..=n`; node 1 masters every partition and the others are replicas.
pub struct TestCluster {
    pub clock: Arc<ManualClock>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn new(n: u64, namespace: NamespaceConfig) -> Self {
        Self::with_config(n, namespace, |_| {})
    }

    /// Cluster whose node configs are adjusted by `tweak` before use.
    pub fn with_config(n: u64, namespace: NamespaceConfig, tweak: impl Fn(&mut Config)) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let replicas: Vec<NodeId> = (2..=n).collect();
        let nodes = (1..=n)
            .map(|id| {
                let mut config = Config::new(id, vec![namespace.clone()]);
                config.transaction.retransmit_ms = 100;
                config.transaction.max_retries = 3;
                config.transaction.transaction_max_ms = 10_000;
                config.truncate.threads = 2;
                tweak(&mut config);
                let config = Arc::new(config);

                let store = Arc::new(MemStore::new());
                let transport = Arc::new(QueueTransport::new());
                let sindex = Arc::new(CountingSindex::new());
                let partitions = Arc::new(StaticPartitionMap::new(
                    1,
                    ReplicaSet::new(1, replicas.clone()),
                ));
                let metrics = Arc::new(KeystoneMetrics::new());
                let truncation = Arc::new(TruncationRegistry::new(
                    &config,
                    store.clone(),
                    sindex.clone(),
                    clock.clone(),
                    metrics.clone(),
                ));
                truncation.done_startup();
                let deps = CoordinatorDeps {
                    store: store.clone(),
                    partitions: partitions.clone(),
                    transport: transport.clone(),
                    sindex: sindex.clone(),
                    clock: clock.clone(),
                };
                let coordinator = Arc::new(Coordinator::new(
                    config,
                    truncation.clone(),
                    deps,
                    metrics.clone(),
                ));
                TestNode {
                    id,
                    coordinator,
                    store,
                    transport,
                    sindex,
                    partitions,
                    truncation,
                    metrics,
                }
            })
            .collect();
        Self { clock, nodes }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[(id - 1) as usize]
    }

    pub fn master(&self) -> &TestNode {
        self.node(1)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes.iter()
    }

    /// Submit a write to the master.
    pub fn write(&self, request: WriteRequest) -> Admission {
        self.master()
            .coordinator
            .write(request)
            .expect("write admitted")
    }

    /// Messages node `id` has queued, removed from its outbox.
    pub fn take_outbox(&self, id: NodeId) -> Vec<(NodeId, Bytes)> {
        self.node(id).transport.take()
    }

    /// Hand `frame` from `from` to its destination.
    #[track_caller]
    pub fn deliver(&self, from: NodeId, to: NodeId, frame: &[u8]) {
        self.node(to)
            .coordinator
            .handle_bytes(from, frame)
            .expect("message handled");
    }

    /// Route messages until every outbox is empty. Returns the number
    /// delivered.
    pub fn deliver_all(&self) -> usize {
        self.deliver_filtered(|_, _| true)
    }

    /// Like [`Self::deliver_all`], but messages for which `keep` is false
    /// are lost.
    pub fn deliver_filtered(&self, keep: impl Fn(NodeId, NodeId) -> bool) -> usize {
        let mut delivered = 0;
        loop {
            let mut batch = Vec::new();
            for node in &self.nodes {
                for (to, frame) in node.transport.take() {
                    batch.push((node.id, to, frame));
                }
            }
            if batch.is_empty() {
                return delivered;
            }
            for (from, to, frame) in batch {
                if keep(from, to) {
                    self.deliver(from, to, &frame);
                    delivered += 1;
                }
            }
            assert!(delivered < 10_000, "message storm between test nodes");
        }
    }

    /// Discard every queued message. Returns how many were lost.
    pub fn drop_all(&self) -> usize {
        self.nodes.iter().map(|n| n.transport.take().len()).sum()
    }

    /// Advance the shared clock and fire the master's retransmit timers.
    pub fn tick(&self, ms: u64) -> usize {
        self.clock.advance(ms);
        self.master().coordinator.retransmit_sweep()
    }
}
