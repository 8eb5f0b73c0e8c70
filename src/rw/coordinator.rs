//! Transaction driver and peer message dispatch.
//!
//! The coordinator admits client writes into the single-flight registry,
//! applies them locally, and executes the [`Action`]s returned by each
//! [`RwRequest`] event method. It is also the receiving side of every
//! peer message: replica writes, duplicate queries, confirmations and
//! pings arrive through [`Coordinator::handle_message`].

use super::dup_res::{dup_reply, DupCandidate, DupOutcome};
use super::policy::{
    advance_record_version, clear_delete_response_metadata, delete_bin, generation_check,
    is_ttl_disallowed, is_valid_ttl, pickle_all, resolve_bin, respond_on_master_complete,
    set_name_check, set_set_from_msg, transition_delete_metadata, udf_delete_bin,
    udf_resolve_bin, void_time_for_ttl, write_is_full_drop, Pickle,
};
use super::registry::{InsertOutcome, RwRequestRegistry};
use super::repl_write::{
    decide_replica_write, ping_reply_code, regime_is_stale, replica_ack_required,
    sufficient_replica_destinations, ReplicaDecision,
};
use super::request::{Action, ReplPlan, RequestId, RwRequest};
use super::{BinOp, WriteRequest, WriteResponse, WriteSource};
use crate::cluster::{NodeId, PartitionMap, RecordStore, ReplicaSet, SindexObserver, Transport};
use crate::core::config::{Config, NamespaceConfig};
use crate::core::error::{KeystoneError, KeystoneResult, ResultCode};
use crate::core::time::Clock;
use crate::ops::observability::KeystoneMetrics;
use crate::record::bin::is_valid_bin_name;
use crate::record::{
    Digest, MetadataSnapshot, MutationGuard, Record, RecordMetadata, ReplState, RequestKey,
};
use crate::truncate::{TruncationRegistry, MAX_SET_NAME_LEN};
use crate::wire::{InfoFlags, RwMessage, RwOp};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// External collaborators.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub store: Arc<dyn RecordStore>,
    pub partitions: Arc<dyn PartitionMap>,
    pub transport: Arc<dyn Transport>,
    pub sindex: Arc<dyn SindexObserver>,
    pub clock: Arc<dyn Clock>,
}

/// Outcome of submitting a write or ping.
#[derive(Debug)]
pub enum Admission {
    /// Registered. The terminal response arrives on `response`.
    Inserted {
        id: RequestId,
        response: oneshot::Receiver<WriteResponse>,
    },
    /// Another transaction owns the key; nothing was created.
    AlreadyInFlight { existing: RequestId },
}

/// Result of applying a write to the local copy.
struct LocalApply {
    record: Record,
    before: Option<RecordMetadata>,
    prior: Option<Record>,
    touched: Vec<String>,
    dropped: bool,
    /// Built on a copy adopted from duplicate resolution.
    adopted: bool,
}

/// Write-path coordinator for one node.
pub struct Coordinator {
    node_id: NodeId,
    config: Arc<Config>,
    registry: RwRequestRegistry,
    truncation: Arc<TruncationRegistry>,
    deps: CoordinatorDeps,
    metrics: Arc<KeystoneMetrics>,
    next_tid: AtomicU64,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node_id", &self.node_id)
            .field("in_flight", &self.registry.count())
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        truncation: Arc<TruncationRegistry>,
        deps: CoordinatorDeps,
        metrics: Arc<KeystoneMetrics>,
    ) -> Self {
        Self {
            node_id: config.node.node_id,
            registry: RwRequestRegistry::new(config.transaction.registry_shards),
            config,
            truncation,
            deps,
            metrics,
            next_tid: AtomicU64::new(1),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn registry(&self) -> &RwRequestRegistry {
        &self.registry
    }

    pub fn truncation(&self) -> &Arc<TruncationRegistry> {
        &self.truncation
    }

    pub fn metrics(&self) -> &Arc<KeystoneMetrics> {
        &self.metrics
    }

    /// Transactions currently registered.
    pub fn in_flight(&self) -> u32 {
        self.registry.count()
    }

    fn now(&self) -> u64 {
        self.deps.clock.now_ms()
    }

    fn next_tid(&self) -> u64 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn ns_config(&self, ns_index: u32) -> KeystoneResult<&NamespaceConfig> {
        self.config
            .namespace_at(ns_index)
            .ok_or(KeystoneError::NamespaceIndex { ns_index })
    }

    /// Replica set of the key's partition, if this node is its master.
    fn owner(&self, key: &RequestKey) -> KeystoneResult<ReplicaSet> {
        let partition_id = key.partition_id();
        self.deps
            .partitions
            .replica_set(key.ns_index, partition_id)
            .filter(|rs| rs.master == self.node_id)
            .ok_or(KeystoneError::NotMaster { partition_id })
    }

    fn local_regime(&self, key: &RequestKey) -> u32 {
        self.deps
            .partitions
            .replica_set(key.ns_index, key.partition_id())
            .map_or(0, |rs| rs.regime)
    }

    fn replica_destinations(&self, rs: &ReplicaSet, ns: &NamespaceConfig) -> Vec<NodeId> {
        let mut dests: Vec<NodeId> = Vec::new();
        for node in &rs.replicas {
            if *node != self.node_id && !dests.contains(node) {
                dests.push(*node);
            }
        }
        dests.truncate(ns.replication_factor.saturating_sub(1) as usize);
        dests
    }

    /// Stored copy of `key`, unless it is truncated or expired.
    fn live_copy(&self, key: &RequestKey) -> KeystoneResult<Option<Record>> {
        let now_secs = self.deps.clock.now_secs();
        Ok(self.deps.store.read(key)?.filter(|record| {
            !self.truncation.record_is_truncated(record) && !record.meta.is_expired_at(now_secs)
        }))
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Submit a client write. Validation failures return an error before
    /// any transaction state exists.
    pub fn write(&self, request: WriteRequest) -> KeystoneResult<Admission> {
        let (ns_index, ns) = self.config.namespace(&request.namespace).ok_or_else(|| {
            KeystoneError::NamespaceNotFound {
                namespace: request.namespace.clone(),
            }
        })?;
        validate_write(&request, ns)?;

        let key = RequestKey::new(ns_index, request.digest);
        let rs = self.owner(&key)?;
        let dests = self.replica_destinations(&rs, ns);
        if !sufficient_replica_destinations(dests.len(), ns.required_replicas) {
            return Err(KeystoneError::InsufficientReplicas {
                available: dests.len(),
                required: ns.required_replicas as usize,
            });
        }
        let now = self.now();
        if self
            .truncation
            .now_is_truncated(ns_index, request.set_name.as_deref(), now)
        {
            return Err(KeystoneError::forbidden(
                "truncation threshold is ahead of the local clock",
            ));
        }

        let (tx, rx) = oneshot::channel();
        let rw = Arc::new(RwRequest::write(
            key,
            request,
            Some(tx),
            now,
            &self.config.transaction,
        ));
        if let InsertOutcome::AlreadyInFlight(existing) = self.registry.insert(Arc::clone(&rw)) {
            self.metrics.record_already_in_flight();
            tracing::debug!(key = %key, existing = %existing, "write already in flight");
            return Ok(Admission::AlreadyInFlight { existing });
        }
        self.metrics.record_admitted();
        self.metrics.set_in_flight(self.registry.count());
        tracing::debug!(key = %key, id = %rw.id, dup_nodes = rs.dup_nodes.len(), "write admitted");

        let actions = if rs.dup_nodes.is_empty() {
            self.apply_write(&rw, None)
        } else {
            let nodes = self.dup_query_nodes(rs.dup_nodes);
            self.start_dup_res(&rw, nodes)
        };
        self.perform(&rw, actions);
        Ok(Admission::Inserted {
            id: rw.id,
            response: rx,
        })
    }

    /// Verify every replica shares this node's regime for the key's
    /// partition. Answers OK or the first mismatch.
    pub fn ping(&self, namespace: &str, digest: Digest) -> KeystoneResult<Admission> {
        let (ns_index, ns) =
            self.config
                .namespace(namespace)
                .ok_or_else(|| KeystoneError::NamespaceNotFound {
                    namespace: namespace.to_string(),
                })?;
        let key = RequestKey::new(ns_index, digest);
        let rs = self.owner(&key)?;
        let dests = self.replica_destinations(&rs, ns);

        let now = self.now();
        let (tx, rx) = oneshot::channel();
        let rw = Arc::new(RwRequest::ping(
            key,
            Some(tx),
            now,
            &self.config.transaction,
        ));
        if let InsertOutcome::AlreadyInFlight(existing) = self.registry.insert(Arc::clone(&rw)) {
            self.metrics.record_already_in_flight();
            return Ok(Admission::AlreadyInFlight { existing });
        }
        self.metrics.record_admitted();

        let tid = self.next_tid();
        let mut msg = RwMessage::keyed(RwOp::ReplPing, &key, tid);
        msg.regime = Some(rs.regime);
        let actions = rw.start_ping(tid, dests, msg, now);
        self.perform(&rw, actions);
        Ok(Admission::Inserted {
            id: rw.id,
            response: rx,
        })
    }

    /// Stop answering transaction `id`. It still runs to completion.
    pub fn abandon(&self, key: &RequestKey, id: RequestId) -> bool {
        match self.registry.lookup(key) {
            Some(rw) if rw.id == id => {
                rw.abandon();
                true
            }
            _ => false,
        }
    }

    /// Fire retransmit timers of every in-flight transaction. Returns the
    /// number of messages resent.
    pub fn retransmit_sweep(&self) -> usize {
        let now = self.now();
        let mut resent = 0;
        for rw in self.registry.snapshot() {
            let actions = rw.on_timer(now);
            let sends = actions
                .iter()
                .filter(|a| matches!(a, Action::Send { .. }))
                .count();
            if sends > 0 {
                tracing::debug!(key = %rw.key, id = %rw.id, sends, "retransmitting");
            }
            resent += sends;
            self.perform(&rw, actions);
        }
        if resent > 0 {
            self.metrics.record_retransmits(resent as u64);
        }
        self.metrics.set_in_flight(self.registry.count());
        resent
    }

    // ========================================================================
    // Coordinating side
    // ========================================================================

    fn dup_query_nodes(&self, mut nodes: Vec<NodeId>) -> Vec<NodeId> {
        nodes.retain(|n| *n != self.node_id);
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    fn start_dup_res(&self, rw: &Arc<RwRequest>, nodes: Vec<NodeId>) -> Vec<Action> {
        let ns = match self.ns_config(rw.key.ns_index) {
            Ok(ns) => ns,
            Err(e) => return rw.fail(e.result_code()),
        };
        let local = match self.live_copy(&rw.key) {
            Ok(local) => local,
            Err(e) => return rw.fail(e.result_code()),
        };
        let tid = self.next_tid();
        let mut query = RwMessage::keyed(RwOp::Dup, &rw.key, tid);
        query.namespace = Some(ns.name.clone());
        if let Some(ref record) = local {
            query.generation = Some(record.meta.generation);
            query.last_update_time = Some(record.meta.last_update_time);
        }
        let candidate = DupCandidate {
            node: self.node_id,
            meta: local.as_ref().map(|r| r.meta),
            record: local,
        };
        rw.start_dup_res(tid, nodes, candidate, ns.dup_res_tie_break, query, self.now())
    }

    /// Put the pre-write copy back and resolve duplicates again across the
    /// replicas that rejected the write.
    fn reresolve(&self, rw: &Arc<RwRequest>, dests: Vec<NodeId>) -> Vec<Action> {
        let restored = match rw.prior() {
            Some(prior) => self.deps.store.write(&prior),
            None => self.deps.store.delete(&rw.key).map(|_| ()),
        };
        if let Err(e) = restored {
            return rw.fail(e.result_code());
        }
        let mut nodes = dests;
        if let Ok(rs) = self.owner(&rw.key) {
            nodes.extend(rs.dup_nodes);
        }
        let nodes = self.dup_query_nodes(nodes);
        tracing::info!(
            key = %rw.key,
            id = %rw.id,
            attempt = rw.reresolves(),
            "replica holds a newer copy; resolving duplicates again"
        );
        self.start_dup_res(rw, nodes)
    }

    /// Apply the write locally and start the replica round.
    fn apply_write(&self, rw: &Arc<RwRequest>, outcome: Option<DupOutcome>) -> Vec<Action> {
        let Some(write) = rw.write_request() else {
            return rw.fail(ResultCode::Unknown);
        };
        let planned = self.owner(&rw.key).and_then(|rs| {
            let ns = self.ns_config(rw.key.ns_index)?;
            let dests = self.replica_destinations(&rs, ns);
            let confirm = ns.confirm_replica_writes && !dests.is_empty();
            let applied = self.apply_local(rw.key, write, ns, confirm, outcome)?;
            self.replication_plan(rw, write, ns, &rs, dests, confirm, applied)
        });
        match planned {
            Ok(plan) => rw.begin_replication(plan, self.now()),
            Err(e) => {
                tracing::debug!(key = %rw.key, id = %rw.id, error = %e, "write rejected");
                rw.fail(e.result_code())
            }
        }
    }

    fn apply_local(
        &self,
        key: RequestKey,
        write: &WriteRequest,
        ns: &NamespaceConfig,
        confirm: bool,
        outcome: Option<DupOutcome>,
    ) -> KeystoneResult<LocalApply> {
        let now_ms = self.now();
        let now_secs = self.deps.clock.now_secs();

        let stored = self.live_copy(&key)?;
        let adopted_copy = outcome
            .and_then(|o| o.record)
            .filter(|r| !self.truncation.record_is_truncated(r));
        let adopted = adopted_copy.is_some();
        let prior = stored.clone();
        let base = adopted_copy.or(stored);

        let exists = base.as_ref().is_some_and(|r| !r.meta.is_tombstone());
        if write.delete && !exists {
            return Err(KeystoneError::RecordNotFound);
        }
        let before = base.as_ref().map(|r| r.meta);
        let mut record = base.unwrap_or_else(|| Record::new(key));
        record.key = key;

        let mut guard = MutationGuard::begin(&mut record);
        if exists {
            set_name_check(&guard, write.set_name.as_deref())?;
            generation_check(guard.meta.generation, write.generation)?;
        }
        set_set_from_msg(&mut guard, write.set_name.as_deref());
        if ns.bin_convergence {
            guard.meta.has_bin_meta = true;
        }
        let lut = advance_record_version(&mut guard.meta, now_ms);

        let mut touched: Vec<String> = Vec::new();
        let mut cleanup = Vec::new();
        let mut n_won = 0;
        if write.delete {
            let names: Vec<String> = guard.live_bins().map(|b| b.name.clone()).collect();
            for name in names {
                if delete_bin(&mut guard, &name, lut, &mut cleanup) {
                    touched.push(name);
                }
            }
        } else {
            for op in &write.ops {
                let changed = match (write.source, op) {
                    (WriteSource::Client, BinOp::Write { name, particle }) => {
                        resolve_bin(&mut guard, name, particle, lut, &mut n_won)
                    }
                    (WriteSource::Client, BinOp::Delete { name }) => {
                        delete_bin(&mut guard, name, lut, &mut cleanup)
                    }
                    (WriteSource::Udf, BinOp::Write { name, particle }) => {
                        udf_resolve_bin(&mut guard, name, particle, lut)
                    }
                    (WriteSource::Udf, BinOp::Delete { name }) => {
                        udf_delete_bin(&mut guard, name, lut, &mut cleanup)
                    }
                };
                if changed && !touched.iter().any(|t| t == op.name()) {
                    touched.push(op.name().to_string());
                }
            }
        }

        guard.meta.void_time =
            void_time_for_ttl(write.ttl, ns, now_secs, before.map(|m| m.void_time));
        let bin_cemetery = write.delete && guard.meta.has_bin_meta;
        transition_delete_metadata(&mut guard.meta, write.delete, bin_cemetery);

        let dropped = write_is_full_drop(write)
            || (!write.delete && !guard.meta.has_bin_meta && guard.is_empty());
        if confirm && !dropped {
            guard.meta.ext_mut().repl_state = ReplState::Unreplicated;
        } else if let Some(ext) = guard.meta.ext.as_mut() {
            ext.repl_state = ReplState::Replicated;
        }

        if dropped {
            self.deps.store.delete(&key)?;
        } else {
            self.deps.store.write(&guard)?;
        }
        let old_bins = guard.commit();
        if dropped {
            if before.is_some() {
                self.deps.sindex.record_removed(&record);
            }
        } else {
            self.deps.sindex.bins_changed(&key, &old_bins, &record.bins);
        }

        Ok(LocalApply {
            record,
            before,
            prior,
            touched,
            dropped,
            adopted,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn replication_plan(
        &self,
        rw: &RwRequest,
        write: &WriteRequest,
        ns: &NamespaceConfig,
        rs: &ReplicaSet,
        dests: Vec<NodeId>,
        confirm: bool,
        applied: LocalApply,
    ) -> KeystoneResult<ReplPlan> {
        let tid = self.next_tid();
        let record = &applied.record;
        let confirm = confirm && !applied.dropped;

        let mut response = WriteResponse {
            result: ResultCode::Ok,
            generation: record.meta.generation,
            last_update_time: record.meta.last_update_time,
            void_time: record.meta.void_time,
        };
        if write.delete {
            clear_delete_response_metadata(&mut response);
        }

        let pickle = if applied.dropped {
            Pickle::drop_record(record.meta, record.set_name.clone())
        } else {
            let full = applied.adopted || write.delete;
            pickle_all(record, applied.before.as_ref(), &applied.touched, full)
        };

        let mut message = RwMessage::keyed(RwOp::ReplWrite, &rw.key, tid);
        message.namespace = Some(ns.name.clone());
        message.regime = Some(rs.regime);
        message.generation = Some(record.meta.generation);
        message.last_update_time = Some(record.meta.last_update_time);
        if applied.dropped {
            message.info |= InfoFlags::NO_REPL_ACK;
        }
        if confirm {
            message.info |= InfoFlags::UNREPLICATED;
        }
        let full_message = if pickle.is_full() || pickle.is_drop() {
            None
        } else {
            let mut full = message.clone();
            full.record = Some(pickle_all(record, None, &[], true).encode()?);
            Some(full)
        };
        message.record = Some(pickle.encode()?);

        Ok(ReplPlan {
            tid,
            dests,
            message,
            full_message,
            response,
            respond_early: respond_on_master_complete(write, ns),
            no_reply: applied.dropped,
            confirm,
            snapshot: applied.prior.as_ref().map(|r| MetadataSnapshot::capture(&r.meta)),
            prior: applied.prior,
        })
    }

    /// Execute actions until none remain.
    fn perform(&self, rw: &Arc<RwRequest>, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send { to, msg } => self.send(to, &msg),
                Action::Apply(outcome) => {
                    if outcome.tie_merged {
                        self.metrics.record_dup_res_tie(outcome.bins_won);
                    } else if outcome.record.is_some() && outcome.winner_node != self.node_id {
                        self.metrics.record_dup_res_remote_win();
                    }
                    queue.extend(self.apply_write(rw, Some(outcome)));
                }
                Action::Reresolve { dests } => queue.extend(self.reresolve(rw, dests)),
                Action::MarkReplicated { last_update_time } => {
                    if let Err(e) = self.mark_replicated(&rw.key, last_update_time) {
                        tracing::warn!(key = %rw.key, error = %e, "failed to clear unreplicated mark");
                    }
                }
                Action::Unwind { last_update_time } => {
                    if let Err(e) = self.unwind(rw, last_update_time) {
                        tracing::warn!(key = %rw.key, id = %rw.id, error = %e, "failed to unwind master copy");
                    }
                }
                Action::Complete { result } => self.complete(rw, result),
            }
        }
    }

    fn complete(&self, rw: &RwRequest, result: ResultCode) {
        if !self.registry.remove(&rw.key, rw.id) {
            return;
        }
        let latency_ms = self.now().saturating_sub(rw.started_ms());
        self.metrics.record_completion(result.is_ok(), latency_ms);
        self.metrics.set_in_flight(self.registry.count());
        tracing::debug!(
            key = %rw.key,
            id = %rw.id,
            result = %result,
            latency_ms,
            "transaction complete"
        );
    }

    fn send(&self, to: NodeId, msg: &RwMessage) {
        let sent = msg
            .encode()
            .and_then(|frame| self.deps.transport.send(to, frame));
        if let Err(e) = sent {
            tracing::warn!(to, op = ?msg.op, error = %e, "send failed");
        }
    }

    /// Put back the copy a failed write replaced. Skipped when a later
    /// write already superseded ours.
    fn unwind(&self, rw: &RwRequest, lut: u64) -> KeystoneResult<()> {
        let Some(current) = self.deps.store.read(&rw.key)? else {
            return Ok(());
        };
        if current.meta.last_update_time != lut {
            tracing::debug!(key = %rw.key, id = %rw.id, "master copy moved on; not unwinding");
            return Ok(());
        }
        match (rw.snapshot(), rw.prior()) {
            (Some(snapshot), Some(prior)) => {
                let mut restored = current.clone();
                snapshot.restore(&mut restored.meta);
                restored.set_name = prior.set_name;
                restored.bins = prior.bins;
                self.deps.store.write(&restored)?;
                self.deps
                    .sindex
                    .bins_changed(&rw.key, &current.bins, &restored.bins);
            }
            _ => {
                self.deps.store.delete(&rw.key)?;
                self.deps.sindex.record_removed(&current);
            }
        }
        tracing::info!(key = %rw.key, id = %rw.id, "unwound failed write on master");
        Ok(())
    }

    fn mark_replicated(&self, key: &RequestKey, lut: u64) -> KeystoneResult<()> {
        if let Some(mut record) = self.deps.store.read(key)? {
            if record.meta.last_update_time == lut && record.meta.is_unreplicated() {
                record.meta.ext_mut().repl_state = ReplState::Replicated;
                self.deps.store.write(&record)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Inbound messages
    // ========================================================================

    /// Decode and dispatch a frame received from `from`.
    pub fn handle_bytes(&self, from: NodeId, frame: &[u8]) -> KeystoneResult<()> {
        let msg = RwMessage::decode(frame)?;
        self.handle_message(from, msg)
    }

    /// Dispatch a peer message received from `from`.
    pub fn handle_message(&self, from: NodeId, msg: RwMessage) -> KeystoneResult<()> {
        match msg.op {
            RwOp::ReplWrite => self.on_repl_write(from, &msg),
            RwOp::Dup => self.on_dup(from, &msg),
            RwOp::ReplPing => self.on_ping(from, &msg),
            RwOp::ReplConfirm if msg.result.is_none() => self.on_confirm_request(from, &msg),
            RwOp::WriteAck | RwOp::DupAck | RwOp::ReplPingAck | RwOp::ReplConfirm => {
                self.on_reply(from, &msg)
            }
        }
    }

    fn on_reply(&self, from: NodeId, msg: &RwMessage) -> KeystoneResult<()> {
        let key = msg.key()?;
        let tid = msg.require_tid()?;
        let Some(rw) = self.registry.lookup(&key) else {
            tracing::debug!(key = %key, tid, op = ?msg.op, "reply for finished transaction");
            return Ok(());
        };
        let code = msg.result.unwrap_or(ResultCode::Unknown);
        let actions = match msg.op {
            RwOp::WriteAck => {
                if !code.is_ok() {
                    self.metrics.record_replica_failure();
                    tracing::debug!(key = %key, from, result = %code, "replica write not applied");
                }
                rw.on_write_ack(from, tid, code, self.now())
            }
            RwOp::DupAck => {
                let (meta, record) = self.dup_candidate(&key, msg)?;
                rw.on_dup_ack(from, tid, code, meta, record)
            }
            RwOp::ReplPingAck => rw.on_ping_ack(from, tid, code),
            RwOp::ReplConfirm => rw.on_confirm_reply(from, tid, code),
            _ => Vec::new(),
        };
        self.perform(&rw, actions);
        Ok(())
    }

    /// Candidate carried by a DUP_ACK. Truncated copies count as absent.
    fn dup_candidate(
        &self,
        key: &RequestKey,
        msg: &RwMessage,
    ) -> KeystoneResult<(Option<RecordMetadata>, Option<Record>)> {
        if msg.result != Some(ResultCode::Ok) {
            return Ok((None, None));
        }
        let record = match msg.record {
            Some(ref bytes) => Pickle::decode(bytes)?.apply_to(*key, None).ok(),
            None => None,
        };
        let meta = match (&record, msg.generation, msg.last_update_time) {
            (Some(r), _, _) => Some(r.meta),
            (None, Some(generation), Some(lut)) => Some(RecordMetadata::new(generation, lut, 0)),
            _ => None,
        };
        let set = record.as_ref().and_then(|r| r.set_name.as_deref());
        let truncated = meta.is_some_and(|m| {
            self.truncation
                .lut_is_truncated(m.last_update_time, key.ns_index, set)
        });
        if truncated {
            return Ok((None, None));
        }
        Ok((meta, record))
    }

    fn on_repl_write(&self, from: NodeId, msg: &RwMessage) -> KeystoneResult<()> {
        let code = self.apply_replica_write(msg).unwrap_or_else(|e| {
            tracing::warn!(from, error = %e, "replica write failed");
            e.result_code()
        });
        if !code.is_ok() {
            self.metrics.record_replica_rejected();
        }
        if replica_ack_required(msg.info) {
            self.send(from, &msg.reply(RwOp::WriteAck, code));
        }
        Ok(())
    }

    fn apply_replica_write(&self, msg: &RwMessage) -> KeystoneResult<ResultCode> {
        let key = msg.key()?;
        msg.require_tid()?;
        let ns = self.ns_config(key.ns_index)?;
        let bytes = msg
            .record
            .as_ref()
            .ok_or_else(|| KeystoneError::wire("REPL_WRITE without record"))?;
        let pickle = Pickle::decode(bytes)?;

        let stale = regime_is_stale(self.local_regime(&key), msg.regime);
        let incoming_truncated = self.truncation.lut_is_truncated(
            pickle.meta.last_update_time,
            key.ns_index,
            pickle.set_name.as_deref(),
        );
        let existing = self.live_copy(&key)?;
        let decision = decide_replica_write(
            key,
            existing.as_ref(),
            &pickle,
            ns.conflict_resolution_policy,
            incoming_truncated,
            stale,
        );
        match decision {
            ReplicaDecision::Store(record) => {
                self.deps.store.write(&record)?;
                let old = existing.map(|r| r.bins).unwrap_or_default();
                self.deps.sindex.bins_changed(&key, &old, &record.bins);
                Ok(ResultCode::Ok)
            }
            ReplicaDecision::Drop => {
                if self.deps.store.delete(&key)? {
                    if let Some(old) = existing {
                        self.deps.sindex.record_removed(&old);
                    }
                }
                Ok(ResultCode::Ok)
            }
            ReplicaDecision::Ignore => Ok(ResultCode::Ok),
            ReplicaDecision::Reject(code) => {
                tracing::debug!(key = %key, result = %code, "replica write rejected");
                Ok(code)
            }
        }
    }

    fn on_dup(&self, from: NodeId, msg: &RwMessage) -> KeystoneResult<()> {
        let key = msg.key()?;
        msg.require_tid()?;
        let local = self.live_copy(&key)?;
        let answer = dup_reply(local.as_ref(), msg.last_update_time);
        let mut reply = msg.reply(RwOp::DupAck, answer.code);
        if let Some(meta) = answer.meta {
            reply.generation = Some(meta.generation);
            reply.last_update_time = Some(meta.last_update_time);
        }
        if let Some(pickle) = answer.pickle {
            reply.record = Some(pickle.encode()?);
        }
        self.send(from, &reply);
        Ok(())
    }

    fn on_confirm_request(&self, from: NodeId, msg: &RwMessage) -> KeystoneResult<()> {
        let key = msg.key()?;
        msg.require_tid()?;
        let code = match msg.last_update_time {
            Some(lut) => self
                .mark_replicated(&key, lut)
                .map_or_else(|e| e.result_code(), |_| ResultCode::Ok),
            None => ResultCode::Parameter,
        };
        self.send(from, &msg.reply(RwOp::ReplConfirm, code));
        Ok(())
    }

    fn on_ping(&self, from: NodeId, msg: &RwMessage) -> KeystoneResult<()> {
        let key = msg.key()?;
        msg.require_tid()?;
        let code = ping_reply_code(self.local_regime(&key), msg.regime);
        self.send(from, &msg.reply(RwOp::ReplPingAck, code));
        Ok(())
    }
}

/// Request-level checks that need no record state.
fn validate_write(request: &WriteRequest, ns: &NamespaceConfig) -> KeystoneResult<()> {
    if !is_valid_ttl(request.ttl) {
        return Err(KeystoneError::InvalidTtl { ttl: request.ttl });
    }
    if is_ttl_disallowed(request.ttl, ns) {
        return Err(KeystoneError::TtlDisallowed {
            ttl: request.ttl,
            namespace: ns.name.clone(),
        });
    }
    if request.delete && !request.ops.is_empty() {
        return Err(KeystoneError::invalid("record delete carries bin operations"));
    }
    if !request.delete && request.ops.is_empty() {
        return Err(KeystoneError::invalid("write has no bin operations"));
    }
    if let Some(op) = request.ops.iter().find(|op| !is_valid_bin_name(op.name())) {
        return Err(KeystoneError::invalid(format!("invalid bin name {:?}", op.name())));
    }
    if let Some(ref set) = request.set_name {
        if set.is_empty() || set.len() > MAX_SET_NAME_LEN {
            return Err(KeystoneError::invalid(format!("invalid set name {:?}", set)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{CountingSindex, MemStore, QueueTransport, StaticPartitionMap};
    use crate::core::time::ManualClock;
    use crate::record::Particle;
    use crate::rw::policy::TTL_NEVER_EXPIRE;

    struct Solo {
        coordinator: Coordinator,
        store: Arc<MemStore>,
        sindex: Arc<CountingSindex>,
    }

    fn solo() -> Solo {
        let config = Arc::new(Config::new(1, vec![NamespaceConfig::named("test")]));
        let store = Arc::new(MemStore::new());
        let sindex = Arc::new(CountingSindex::new());
        let clock = Arc::new(ManualClock::new(50_000));
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
            partitions: Arc::new(StaticPartitionMap::new(1, ReplicaSet::new(1, vec![]))),
            transport: Arc::new(QueueTransport::new()),
            sindex: sindex.clone(),
            clock,
        };
        Solo {
            coordinator: Coordinator::new(config, truncation, deps, metrics),
            store,
            sindex,
        }
    }

    fn respond(coordinator: &Coordinator, request: WriteRequest) -> WriteResponse {
        match coordinator.write(request).unwrap() {
            Admission::Inserted { mut response, .. } => response.try_recv().unwrap(),
            other => panic!("unexpected admission {:?}", other),
        }
    }

    #[test]
    fn single_node_write_completes_immediately() {
        let solo = solo();
        let digest = Digest([1; 20]);
        let response = respond(
            &solo.coordinator,
            WriteRequest::new("test", digest).put("a", Particle::Integer(1)),
        );
        assert_eq!(response.result, ResultCode::Ok);
        assert_eq!(response.generation, 1);
        assert_eq!(response.last_update_time, 50_000);
        assert_eq!(solo.coordinator.in_flight(), 0);
        assert_eq!(solo.store.len(), 1);
        assert_eq!(solo.sindex.changes(), 1);
    }

    #[test]
    fn generation_mismatch_unwinds() {
        let solo = solo();
        let digest = Digest([2; 20]);
        respond(
            &solo.coordinator,
            WriteRequest::new("test", digest).put("a", Particle::Integer(1)),
        );
        let response = respond(
            &solo.coordinator,
            WriteRequest::new("test", digest)
                .put("a", Particle::Integer(2))
                .expect_generation(7),
        );
        assert_eq!(response.result, ResultCode::Generation);

        let stored = solo.store.read(&RequestKey::new(0, digest)).unwrap().unwrap();
        assert_eq!(stored.meta.generation, 1);
        assert_eq!(stored.value("a"), Some(&Particle::Integer(1)));
    }

    #[test]
    fn validation_creates_no_state() {
        let solo = solo();
        let digest = Digest([3; 20]);
        assert!(matches!(
            solo.coordinator.write(WriteRequest::new("nope", digest).put("a", Particle::Integer(1))),
            Err(KeystoneError::NamespaceNotFound { .. })
        ));
        assert!(matches!(
            solo.coordinator.write(WriteRequest::new("test", digest)),
            Err(KeystoneError::InvalidRequest { .. })
        ));
        assert!(matches!(
            solo.coordinator
                .write(WriteRequest::new("test", digest).put("a", Particle::Integer(1)).with_ttl(TTL_NEVER_EXPIRE - 2)),
            Err(KeystoneError::InvalidTtl { .. })
        ));
        assert!(matches!(
            solo.coordinator
                .write(WriteRequest::new("test", digest).put("this-name-is-too-long", Particle::Integer(1))),
            Err(KeystoneError::InvalidRequest { .. })
        ));
        assert_eq!(solo.coordinator.in_flight(), 0);
        assert!(solo.store.is_empty());
    }

    #[test]
    fn delete_missing_record_is_not_found() {
        let solo = solo();
        let response = respond(
            &solo.coordinator,
            WriteRequest::new("test", Digest([4; 20])).delete_record(false),
        );
        assert_eq!(response.result, ResultCode::NotFound);
    }

    #[test]
    fn delete_clears_response_metadata() {
        let solo = solo();
        let digest = Digest([5; 20]);
        respond(
            &solo.coordinator,
            WriteRequest::new("test", digest).put("a", Particle::Integer(1)),
        );
        let response = respond(
            &solo.coordinator,
            WriteRequest::new("test", digest).delete_record(false),
        );
        assert_eq!(response.result, ResultCode::Ok);
        assert_eq!(response.generation, 0);
        assert_eq!(response.last_update_time, 0);
        assert!(solo.store.is_empty());
        assert_eq!(solo.sindex.removals(), 1);
    }

    #[test]
    fn set_is_immutable() {
        let solo = solo();
        let digest = Digest([6; 20]);
        respond(
            &solo.coordinator,
            WriteRequest::new("test", digest)
                .with_set("users")
                .put("a", Particle::Integer(1)),
        );
        let response = respond(
            &solo.coordinator,
            WriteRequest::new("test", digest)
                .with_set("orders")
                .put("a", Particle::Integer(2)),
        );
        assert_eq!(response.result, ResultCode::Parameter);
    }

    #[test]
    fn not_master_is_rejected() {
        let solo = solo();
        let key = RequestKey::new(0, Digest([7; 20]));
        // Route the key's partition to another node.
        let map = StaticPartitionMap::new(1, ReplicaSet::new(1, vec![]));
        map.set(0, key.partition_id(), ReplicaSet::new(2, vec![1]));
        let coordinator = Coordinator::new(
            solo.coordinator.config.clone(),
            solo.coordinator.truncation.clone(),
            CoordinatorDeps {
                partitions: Arc::new(map),
                ..solo.coordinator.deps.clone()
            },
            solo.coordinator.metrics.clone(),
        );
        assert!(matches!(
            coordinator.write(WriteRequest::new("test", key.digest).put("a", Particle::Integer(1))),
            Err(KeystoneError::NotMaster { .. })
        ));
    }
}
