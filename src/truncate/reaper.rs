//! Reaping workers.
//!
//! A pass spawns `truncate.threads` OS threads for one namespace. Workers
//! claim partitions from a shared cursor and remove every record at or
//! below the effective threshold. The store evaluates the truncation
//! predicate atomically with each removal, so a record rewritten after the
//! command is never reaped. Across all namespaces at most
//! `truncate.max_threads` workers of one registry hold a permit at once.

use super::registry::{NamespaceTruncation, TruncatePhase, TruncationRegistry};
use super::MAX_TRUNCATE_THREADS;
use crate::record::N_PARTITIONS;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Counting semaphore over OS threads.
#[derive(Debug)]
pub struct PermitPool {
    available: Mutex<u32>,
    freed: Condvar,
}

impl PermitPool {
    pub const fn new(permits: u32) -> Self {
        Self {
            available: Mutex::new(permits),
            freed: Condvar::new(),
        }
    }

    /// Block until a permit is free.
    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock();
        while *available == 0 {
            self.freed.wait(&mut available);
        }
        *available -= 1;
        Permit { pool: self }
    }

    pub fn available(&self) -> u32 {
        *self.available.lock()
    }
}

/// Held for the lifetime of a worker.
#[derive(Debug)]
pub struct Permit<'a> {
    pool: &'a PermitPool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *self.pool.available.lock() += 1;
        self.pool.freed.notify_one();
    }
}

/// Shared cursor of one pass.
#[derive(Debug)]
struct Pass {
    ns_index: u32,
    next_partition: AtomicU32,
}

/// Start a pass over `ns_index`. The caller holds the table lock and
/// passes the namespace's entry.
pub(super) fn start_pass(
    registry: &Arc<TruncationRegistry>,
    ns_index: u32,
    ns: &mut NamespaceTruncation,
) {
    if registry.is_shutdown() {
        ns.phase = TruncatePhase::Idle;
        return;
    }
    ns.phase = TruncatePhase::Running;
    ns.abort = false;
    ns.reset_run();

    let pass = Arc::new(Pass {
        ns_index,
        next_partition: AtomicU32::new(0),
    });
    let n_threads = registry.threads_per_pass.clamp(1, MAX_TRUNCATE_THREADS);
    tracing::info!(
        namespace = %registry.namespace_name(ns_index),
        threads = n_threads,
        "truncate pass starting"
    );

    let mut handles = registry.handles.lock();
    handles.retain(|h| !h.is_finished());
    for worker in 0..n_threads {
        let registry = Arc::clone(registry);
        let pass = Arc::clone(&pass);
        let spawned = std::thread::Builder::new()
            .name(format!("truncate-{}-{}", ns_index, worker))
            .spawn(move || run_worker(registry, pass));
        match spawned {
            Ok(handle) => {
                ns.n_threads_running += 1;
                handles.push(handle);
            }
            Err(e) => tracing::error!(error = %e, "failed to spawn truncate reaper"),
        }
    }
    if ns.n_threads_running == 0 {
        ns.phase = TruncatePhase::Idle;
        registry.idle.notify_all();
    }
}

fn run_worker(registry: Arc<TruncationRegistry>, pass: Arc<Pass>) {
    let permit = registry.permits.acquire();
    let mut reaped = 0u64;

    while !registry.pass_interrupted(pass.ns_index) {
        let partition_id = pass.next_partition.fetch_add(1, Ordering::Relaxed);
        if partition_id >= N_PARTITIONS {
            break;
        }
        for key in registry.store.partition_keys(pass.ns_index, partition_id) {
            let truncated = |record: &crate::record::Record| registry.record_is_truncated(record);
            match registry.store.delete_if(&key, &truncated) {
                Ok(Some(removed)) => {
                    registry.sindex.record_removed(&removed);
                    reaped += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "truncate reap failed"),
            }
        }
    }

    drop(permit);
    tracing::debug!(ns_index = pass.ns_index, reaped, "truncate worker done");
    registry.worker_finished(pass.ns_index, reaped);
}
