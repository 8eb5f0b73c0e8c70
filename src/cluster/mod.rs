//! Collaborator interfaces consumed by the write path.
//!
//! Storage, secondary indexes, partition ownership and peer transport are
//! owned elsewhere in a full node. The coordinator sees them only through
//! the traits below; [`memory`] provides in-process implementations used
//! by tests and the `start` command.

pub mod memory;

use crate::core::error::KeystoneResult;
use crate::record::{Bin, Record, RequestKey};
use bytes::Bytes;

/// Cluster node identifier.
pub type NodeId = u64;

/// Ownership of one partition as seen by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSet {
    /// Node coordinating writes for the partition.
    pub master: NodeId,
    /// Replica nodes, master excluded, in preference order.
    pub replicas: Vec<NodeId>,
    /// Nodes that may hold a divergent copy and must be consulted
    /// before the master trusts its own version.
    pub dup_nodes: Vec<NodeId>,
    /// Ownership generation of the partition.
    pub regime: u32,
}

impl ReplicaSet {
    /// Partition owned by `master` with the given replicas.
    pub fn new(master: NodeId, replicas: Vec<NodeId>) -> Self {
        Self {
            master,
            replicas,
            dup_nodes: Vec::new(),
            regime: 0,
        }
    }
}

/// Record storage with in-place mutation.
pub trait RecordStore: Send + Sync {
    /// Read a record.
    fn read(&self, key: &RequestKey) -> KeystoneResult<Option<Record>>;

    /// Insert or replace a record.
    fn write(&self, record: &Record) -> KeystoneResult<()>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, key: &RequestKey) -> KeystoneResult<bool>;

    /// Remove a record iff `predicate` holds, evaluated atomically with
    /// the removal. Returns the removed record.
    fn delete_if(
        &self,
        key: &RequestKey,
        predicate: &dyn Fn(&Record) -> bool,
    ) -> KeystoneResult<Option<Record>>;

    /// Keys of every record in one partition of a namespace.
    fn partition_keys(&self, ns_index: u32, partition_id: u32) -> Vec<RequestKey>;
}

/// Secondary-index maintenance hooks.
pub trait SindexObserver: Send + Sync {
    /// Bin values of a record changed.
    fn bins_changed(&self, key: &RequestKey, old: &[Bin], new: &[Bin]);

    /// A record was removed.
    fn record_removed(&self, record: &Record);
}

/// Current partition ownership.
pub trait PartitionMap: Send + Sync {
    /// Replica set of a partition, or `None` if the namespace is unknown.
    fn replica_set(&self, ns_index: u32, partition_id: u32) -> Option<ReplicaSet>;
}

/// Peer message transport.
///
/// `send` hands an encoded message off and returns immediately. Replies
/// come back through [`crate::rw::Coordinator::handle_bytes`].
pub trait Transport: Send + Sync {
    fn send(&self, to: NodeId, payload: Bytes) -> KeystoneResult<()>;
}
