//! In-memory collaborators.

use super::{NodeId, PartitionMap, RecordStore, ReplicaSet, SindexObserver, Transport};
use crate::core::error::{KeystoneError, KeystoneResult};
use crate::record::{Bin, Record, RequestKey};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Hash-map record store.
#[derive(Debug, Default)]
pub struct MemStore {
    records: RwLock<HashMap<RequestKey, Record>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl RecordStore for MemStore {
    fn read(&self, key: &RequestKey) -> KeystoneResult<Option<Record>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn write(&self, record: &Record) -> KeystoneResult<()> {
        self.records.write().insert(record.key, record.clone());
        Ok(())
    }

    fn delete(&self, key: &RequestKey) -> KeystoneResult<bool> {
        Ok(self.records.write().remove(key).is_some())
    }

    fn delete_if(
        &self,
        key: &RequestKey,
        predicate: &dyn Fn(&Record) -> bool,
    ) -> KeystoneResult<Option<Record>> {
        let mut records = self.records.write();
        match records.get(key) {
            Some(record) if predicate(record) => Ok(records.remove(key)),
            _ => Ok(None),
        }
    }

    fn partition_keys(&self, ns_index: u32, partition_id: u32) -> Vec<RequestKey> {
        let mut keys: Vec<RequestKey> = self
            .records
            .read()
            .keys()
            .filter(|k| k.ns_index == ns_index && k.partition_id() == partition_id)
            .copied()
            .collect();
        keys.sort();
        keys
    }
}

/// Partition map with one default replica set and per-partition overrides.
#[derive(Debug)]
pub struct StaticPartitionMap {
    namespaces: u32,
    default: RwLock<ReplicaSet>,
    overrides: RwLock<HashMap<(u32, u32), ReplicaSet>>,
}

impl StaticPartitionMap {
    /// Every partition of `namespaces` namespaces uses `default`.
    pub fn new(namespaces: u32, default: ReplicaSet) -> Self {
        Self {
            namespaces,
            default: RwLock::new(default),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the default replica set.
    pub fn set_default(&self, replica_set: ReplicaSet) {
        *self.default.write() = replica_set;
    }

    /// Override one partition.
    pub fn set(&self, ns_index: u32, partition_id: u32, replica_set: ReplicaSet) {
        self.overrides
            .write()
            .insert((ns_index, partition_id), replica_set);
    }

    /// Advance the regime of every partition.
    pub fn bump_regime(&self) {
        self.default.write().regime += 1;
        for rs in self.overrides.write().values_mut() {
            rs.regime += 1;
        }
    }
}

impl PartitionMap for StaticPartitionMap {
    fn replica_set(&self, ns_index: u32, partition_id: u32) -> Option<ReplicaSet> {
        if ns_index >= self.namespaces {
            return None;
        }
        if let Some(rs) = self.overrides.read().get(&(ns_index, partition_id)) {
            return Some(rs.clone());
        }
        Some(self.default.read().clone())
    }
}

/// Transport that queues outbound messages for a test harness to route.
#[derive(Debug, Default)]
pub struct QueueTransport {
    outbox: Mutex<Vec<(NodeId, Bytes)>>,
    unreachable: RwLock<HashSet<NodeId>>,
    sent: AtomicU64,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain queued messages.
    pub fn take(&self) -> Vec<(NodeId, Bytes)> {
        std::mem::take(&mut *self.outbox.lock())
    }

    /// Messages currently queued.
    pub fn pending(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Total messages accepted since creation.
    pub fn sent_total(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Refuse sends to `node`.
    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }
}

impl Transport for QueueTransport {
    fn send(&self, to: NodeId, payload: Bytes) -> KeystoneResult<()> {
        if self.unreachable.read().contains(&to) {
            return Err(KeystoneError::Transport {
                node: to,
                message: "node unreachable".to_string(),
            });
        }
        self.outbox.lock().push((to, payload));
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Secondary-index observer that only counts notifications.
#[derive(Debug, Default)]
pub struct CountingSindex {
    changes: AtomicU64,
    removals: AtomicU64,
}

impl CountingSindex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    pub fn removals(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }
}

impl SindexObserver for CountingSindex {
    fn bins_changed(&self, _key: &RequestKey, _old: &[Bin], _new: &[Bin]) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_removed(&self, _record: &Record) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }
}
