//! Single-flight registry of in-flight transactions.
//!
//! At most one [`RwRequest`] exists per [`RequestKey`]. The map is sharded
//! by digest bits so unrelated keys rarely share a lock; each shard is an
//! independent mutex and no operation holds two shards at once.

use super::request::{RequestId, RwRequest};
use crate::record::RequestKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another transaction owns the key.
    AlreadyInFlight(RequestId),
}

type Shard = Mutex<HashMap<RequestKey, Arc<RwRequest>>>;

/// Sharded single-flight map.
#[derive(Debug)]
pub struct RwRequestRegistry {
    shards: Box<[Shard]>,
    mask: u32,
}

impl RwRequestRegistry {
    /// Registry with `n_shards` shards, rounded up to a power of two.
    pub fn new(n_shards: usize) -> Self {
        let n = n_shards.max(1).next_power_of_two();
        let shards = (0..n).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            mask: (n - 1) as u32,
        }
    }

    fn shard(&self, key: &RequestKey) -> &Shard {
        &self.shards[(key.digest.shard_bits() & self.mask) as usize]
    }

    /// Insert iff no transaction owns the request's key.
    pub fn insert(&self, request: Arc<RwRequest>) -> InsertOutcome {
        let mut shard = self.shard(&request.key).lock();
        if let Some(existing) = shard.get(&request.key) {
            return InsertOutcome::AlreadyInFlight(existing.id);
        }
        shard.insert(request.key, request);
        InsertOutcome::Inserted
    }

    /// Remove the entry for `key` only if it is transaction `id`.
    pub fn remove(&self, key: &RequestKey, id: RequestId) -> bool {
        let mut shard = self.shard(key).lock();
        match shard.get(key) {
            Some(existing) if existing.id == id => {
                shard.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Transaction owning `key`.
    pub fn lookup(&self, key: &RequestKey) -> Option<Arc<RwRequest>> {
        self.shard(key).lock().get(key).cloned()
    }

    /// Entries across all shards. Diagnostic only.
    pub fn count(&self) -> u32 {
        self.shards.iter().map(|s| s.lock().len() as u32).sum()
    }

    /// Handles of every in-flight transaction.
    pub fn snapshot(&self) -> Vec<Arc<RwRequest>> {
        self.shards
            .iter()
            .flat_map(|s| s.lock().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Log every in-flight key at debug level.
    pub fn dump(&self) {
        let requests = self.snapshot();
        tracing::debug!(count = requests.len(), "in-flight transactions");
        for request in requests {
            tracing::debug!(
                key = %request.key,
                id = %request.id,
                phase = ?request.phase(),
                "in-flight"
            );
        }
    }
}
