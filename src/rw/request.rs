//! Per-key transaction state.
//!
//! An [`RwRequest`] is the handle stored in the single-flight registry.
//! Replies and timer ticks arrive on arbitrary threads as calls to its
//! event methods (`on_write_ack`, `on_dup_ack`, `on_timer`, ...). Each
//! method takes the private state lock, advances the phase, and returns the
//! [`Action`]s the coordinator must perform once the lock is released.

use super::dup_res::{DupCandidate, DupOutcome, DupProgress, DupResPhase, DupResolution};
use super::repl_write::{should_retransmit_replicas, ReplPhase, ReplVerdict};
use super::{WriteRequest, WriteResponse};
use crate::cluster::NodeId;
use crate::core::config::{TieBreak, TransactionConfig};
use crate::core::error::ResultCode;
use crate::record::{MetadataSnapshot, Record, RecordMetadata, RequestKey};
use crate::wire::{RwMessage, RwOp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique transaction identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Allocate the next identity.
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rw-{}", self.0)
    }
}

/// Protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DupRes(DupResPhase),
    Repl(ReplPhase),
    Ping,
    Done,
    Failed(ResultCode),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed(_) | Self::DupRes(DupResPhase::TimedOut)
        )
    }
}

/// What the transaction does.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Write(WriteRequest),
    /// Regime check with every replica.
    Ping,
}

/// Work for the coordinator, performed outside the request lock.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send { to: NodeId, msg: RwMessage },
    /// Duplicate resolution finished; apply the write on top of the outcome.
    Apply(DupOutcome),
    /// Restore the local copy and resolve duplicates again across `dests`.
    Reresolve { dests: Vec<NodeId> },
    /// Confirmation finished; clear the master copy's unreplicated mark.
    MarkReplicated { last_update_time: u64 },
    /// The transaction failed after the master applied it; put back the
    /// copy that write replaced, if it is still the one stored.
    Unwind { last_update_time: u64 },
    /// Terminal; drop the registry entry.
    Complete { result: ResultCode },
}

/// Everything needed to start the replica-write round.
#[derive(Debug, Clone)]
pub struct ReplPlan {
    pub tid: u64,
    pub dests: Vec<NodeId>,
    pub message: RwMessage,
    /// Whole-record variant for destinations that cannot apply the delta.
    pub full_message: Option<RwMessage>,
    pub response: WriteResponse,
    pub respond_early: bool,
    /// Replicas do not answer; finish as soon as the sends are out.
    pub no_reply: bool,
    pub confirm: bool,
    pub snapshot: Option<MetadataSnapshot>,
    pub prior: Option<Record>,
}

/// Bitmap over a destination list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckSet(u128);

impl AckSet {
    pub const CAPACITY: usize = 128;

    pub fn insert(&mut self, ix: usize) {
        self.0 |= 1 << ix;
    }

    pub fn contains(&self, ix: usize) -> bool {
        self.0 & (1 << ix) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// One outbound round: a message to every destination and their answers.
#[derive(Debug, Default)]
struct Round {
    dests: Vec<NodeId>,
    acked: AckSet,
    needs_full: AckSet,
    sends: Vec<u32>,
    message: Option<RwMessage>,
    full_message: Option<RwMessage>,
}

impl Round {
    fn new(mut dests: Vec<NodeId>, message: RwMessage, full_message: Option<RwMessage>) -> Self {
        dests.truncate(AckSet::CAPACITY);
        let sends = vec![0; dests.len()];
        Self {
            dests,
            acked: AckSet::default(),
            needs_full: AckSet::default(),
            sends,
            message: Some(message),
            full_message,
        }
    }

    fn index_of(&self, node: NodeId) -> Option<usize> {
        self.dests.iter().position(|d| *d == node)
    }

    fn is_complete(&self) -> bool {
        self.acked.len() == self.dests.len()
    }

    fn send_to(&mut self, ix: usize) -> Option<Action> {
        let msg = if self.needs_full.contains(ix) {
            self.full_message.clone().or_else(|| self.message.clone())
        } else {
            self.message.clone()
        }?;
        self.sends[ix] += 1;
        Some(Action::Send {
            to: self.dests[ix],
            msg,
        })
    }

    fn send_pending(&mut self) -> Vec<Action> {
        (0..self.dests.len())
            .filter(|ix| !self.acked.contains(*ix))
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|ix| self.send_to(ix))
            .collect()
    }
}

struct RwState {
    phase: Phase,
    tid: u64,
    round: Round,
    dup: Option<DupResolution>,
    attempts: u32,
    next_retransmit_ms: u64,
    reresolves: u32,
    snapshot: Option<MetadataSnapshot>,
    prior: Option<Record>,
    response: Option<WriteResponse>,
    origin: Option<oneshot::Sender<WriteResponse>>,
    abandoned: bool,
    responded: bool,
    confirm: bool,
    lut: u64,
    /// The master copy holds this transaction's write.
    applied: bool,
}

impl RwState {
    fn respond(&mut self, response: WriteResponse) {
        if self.responded {
            return;
        }
        self.responded = true;
        if let Some(tx) = self.origin.take() {
            if !self.abandoned {
                let _ = tx.send(response);
            }
        }
    }

    fn finish_done(&mut self) -> Vec<Action> {
        self.phase = Phase::Done;
        let response = self.response.unwrap_or(WriteResponse::bare(ResultCode::Ok));
        self.respond(response);
        let mut actions = Vec::with_capacity(2);
        if self.confirm {
            actions.push(Action::MarkReplicated {
                last_update_time: self.lut,
            });
        }
        actions.push(Action::Complete {
            result: ResultCode::Ok,
        });
        actions
    }

    fn finish_failed(&mut self, code: ResultCode) -> Vec<Action> {
        if !self.phase.is_terminal() {
            self.phase = Phase::Failed(code);
        }
        let mut actions = Vec::with_capacity(2);
        // A client already told OK keeps the write.
        if self.applied && !self.responded {
            self.applied = false;
            actions.push(Action::Unwind {
                last_update_time: self.lut,
            });
        }
        self.respond(WriteResponse::bare(code));
        actions.push(Action::Complete { result: code });
        actions
    }
}

/// In-flight transaction handle.
pub struct RwRequest {
    pub id: RequestId,
    pub key: RequestKey,
    kind: RequestKind,
    started_ms: u64,
    timing: TransactionConfig,
    state: Mutex<RwState>,
}

impl std::fmt::Debug for RwRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwRequest")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("phase", &self.phase())
            .finish()
    }
}

impl RwRequest {
    /// Transaction for a client write.
    pub fn write(
        key: RequestKey,
        write: WriteRequest,
        origin: Option<oneshot::Sender<WriteResponse>>,
        now_ms: u64,
        timing: &TransactionConfig,
    ) -> Self {
        Self::with_kind(key, RequestKind::Write(write), origin, now_ms, timing)
    }

    /// Transaction for a replica ping.
    pub fn ping(
        key: RequestKey,
        origin: Option<oneshot::Sender<WriteResponse>>,
        now_ms: u64,
        timing: &TransactionConfig,
    ) -> Self {
        Self::with_kind(key, RequestKind::Ping, origin, now_ms, timing)
    }

    fn with_kind(
        key: RequestKey,
        kind: RequestKind,
        origin: Option<oneshot::Sender<WriteResponse>>,
        now_ms: u64,
        timing: &TransactionConfig,
    ) -> Self {
        let phase = match kind {
            RequestKind::Write(_) => Phase::Repl(ReplPhase::Preparing),
            RequestKind::Ping => Phase::Ping,
        };
        Self {
            id: RequestId::next(),
            key,
            kind,
            started_ms: now_ms,
            timing: timing.clone(),
            state: Mutex::new(RwState {
                phase,
                tid: 0,
                round: Round::default(),
                dup: None,
                attempts: 0,
                next_retransmit_ms: now_ms,
                reresolves: 0,
                snapshot: None,
                prior: None,
                response: None,
                origin,
                abandoned: false,
                responded: false,
                confirm: false,
                lut: 0,
                applied: false,
            }),
        }
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// The client write, for write transactions.
    pub fn write_request(&self) -> Option<&WriteRequest> {
        match self.kind {
            RequestKind::Write(ref write) => Some(write),
            RequestKind::Ping => None,
        }
    }

    pub fn started_ms(&self) -> u64 {
        self.started_ms
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn tid(&self) -> u64 {
        self.state.lock().tid
    }

    /// Retransmit rounds spent in the current phase.
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Messages sent to `node` in the current round.
    pub fn sends_to(&self, node: NodeId) -> u32 {
        let state = self.state.lock();
        state
            .round
            .index_of(node)
            .map_or(0, |ix| state.round.sends[ix])
    }

    pub fn reresolves(&self) -> u32 {
        self.state.lock().reresolves
    }

    /// Metadata of the local copy before this transaction's mutation.
    pub fn snapshot(&self) -> Option<MetadataSnapshot> {
        self.state.lock().snapshot
    }

    /// Local copy before this transaction's mutation.
    pub fn prior(&self) -> Option<Record> {
        self.state.lock().prior.clone()
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.lock().abandoned
    }

    fn backoff(&self, attempts: u32) -> u64 {
        self.timing
            .retransmit_ms
            .saturating_mul(1u64 << attempts.min(10))
    }

    // ========================================================================
    // Duplicate resolution
    // ========================================================================

    /// Query `nodes` for their copies. `local` is this node's own candidate.
    pub fn start_dup_res(
        &self,
        tid: u64,
        nodes: Vec<NodeId>,
        local: DupCandidate,
        tie_break: TieBreak,
        query: RwMessage,
        now_ms: u64,
    ) -> Vec<Action> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return Vec::new();
        }
        state.phase = Phase::DupRes(DupResPhase::Querying);
        state.tid = tid;
        state.round = Round::new(nodes, query, None);
        let dup = DupResolution::new(local, state.round.dests.clone(), tie_break);

        if state.round.dests.is_empty() {
            let progress = dup.resolve();
            state.dup = Some(dup);
            return self.dup_progress(&mut state, progress);
        }
        state.dup = Some(dup);
        state.attempts = 0;
        state.next_retransmit_ms = now_ms + self.backoff(0);
        let actions = state.round.send_pending();
        state.phase = Phase::DupRes(DupResPhase::Collecting);
        actions
    }

    /// A DUP_ACK arrived.
    pub fn on_dup_ack(
        &self,
        from: NodeId,
        tid: u64,
        code: ResultCode,
        meta: Option<RecordMetadata>,
        record: Option<Record>,
    ) -> Vec<Action> {
        let mut state = self.state.lock();
        if state.tid != tid || state.phase != Phase::DupRes(DupResPhase::Collecting) {
            return Vec::new();
        }
        let Some(progress) = state
            .dup
            .as_mut()
            .map(|dup| dup.on_reply(from, code, meta, record))
        else {
            return Vec::new();
        };
        if progress != DupProgress::Retry {
            if let Some(ix) = state.round.index_of(from) {
                state.round.acked.insert(ix);
            }
        }
        self.dup_progress(&mut state, progress)
    }

    fn dup_progress(&self, state: &mut RwState, progress: DupProgress) -> Vec<Action> {
        match progress {
            DupProgress::Pending | DupProgress::Retry => Vec::new(),
            DupProgress::Resolved(outcome) => {
                state.phase = Phase::DupRes(DupResPhase::Resolved);
                vec![Action::Apply(outcome)]
            }
            DupProgress::Failed(code) => state.finish_failed(code),
        }
    }

    // ========================================================================
    // Replica writes
    // ========================================================================

    /// The local write is durable; ship it.
    pub fn begin_replication(&self, plan: ReplPlan, now_ms: u64) -> Vec<Action> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return Vec::new();
        }
        state.phase = Phase::Repl(ReplPhase::Preparing);
        state.tid = plan.tid;
        state.snapshot = plan.snapshot;
        state.prior = plan.prior;
        state.response = Some(plan.response);
        state.lut = plan.response.last_update_time;
        state.applied = true;
        state.confirm = plan.confirm && !plan.dests.is_empty();

        if plan.dests.is_empty() {
            return state.finish_done();
        }

        state.phase = Phase::Repl(ReplPhase::Sending);
        state.round = Round::new(plan.dests, plan.message, plan.full_message);
        state.attempts = 0;
        state.next_retransmit_ms = now_ms + self.backoff(0);
        let mut actions = state.round.send_pending();

        if plan.no_reply {
            actions.extend(state.finish_done());
            return actions;
        }
        state.phase = Phase::Repl(ReplPhase::AwaitingAcks);
        if plan.respond_early {
            state.respond(plan.response);
        }
        actions
    }

    /// A WRITE_ACK arrived.
    pub fn on_write_ack(&self, from: NodeId, tid: u64, code: ResultCode, now_ms: u64) -> Vec<Action> {
        let mut state = self.state.lock();
        if state.tid != tid || state.phase != Phase::Repl(ReplPhase::AwaitingAcks) {
            return Vec::new();
        }
        let Some(ix) = state.round.index_of(from) else {
            return Vec::new();
        };
        match should_retransmit_replicas(code) {
            ReplVerdict::Ack => {
                state.round.acked.insert(ix);
                if !state.round.is_complete() {
                    Vec::new()
                } else if state.confirm {
                    self.start_confirm(&mut state, now_ms)
                } else {
                    state.finish_done()
                }
            }
            ReplVerdict::Retransmit => Vec::new(),
            ReplVerdict::ResendFull => {
                state.round.needs_full.insert(ix);
                state.round.send_to(ix).into_iter().collect()
            }
            ReplVerdict::Reresolve => {
                if state.reresolves >= self.timing.max_reresolves {
                    return state.finish_failed(ResultCode::LostConflict);
                }
                state.reresolves += 1;
                // Re-resolution restores the prior copy itself.
                state.applied = false;
                state.phase = Phase::DupRes(DupResPhase::Querying);
                let dests = std::mem::take(&mut state.round).dests;
                vec![Action::Reresolve { dests }]
            }
            ReplVerdict::Fail(code) => state.finish_failed(code),
        }
    }

    fn start_confirm(&self, state: &mut RwState, now_ms: u64) -> Vec<Action> {
        state.phase = Phase::Repl(ReplPhase::Confirming);
        let mut confirm = RwMessage::keyed(RwOp::ReplConfirm, &self.key, state.tid);
        confirm.last_update_time = Some(state.lut);
        let dests = std::mem::take(&mut state.round).dests;
        state.round = Round::new(dests, confirm, None);
        state.attempts = 0;
        state.next_retransmit_ms = now_ms + self.backoff(0);
        state.round.send_pending()
    }

    /// A REPL_CONFIRM reply arrived.
    pub fn on_confirm_reply(&self, from: NodeId, tid: u64, code: ResultCode) -> Vec<Action> {
        let mut state = self.state.lock();
        if state.tid != tid || state.phase != Phase::Repl(ReplPhase::Confirming) {
            return Vec::new();
        }
        let Some(ix) = state.round.index_of(from) else {
            return Vec::new();
        };
        match should_retransmit_replicas(code) {
            ReplVerdict::Ack => {
                state.round.acked.insert(ix);
                if state.round.is_complete() {
                    state.finish_done()
                } else {
                    Vec::new()
                }
            }
            ReplVerdict::Retransmit => Vec::new(),
            _ => state.finish_failed(code),
        }
    }

    // ========================================================================
    // Ping
    // ========================================================================

    /// Ask every replica to confirm it shares the coordinator's regime.
    pub fn start_ping(&self, tid: u64, dests: Vec<NodeId>, ping: RwMessage, now_ms: u64) -> Vec<Action> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return Vec::new();
        }
        state.tid = tid;
        if dests.is_empty() {
            return state.finish_done();
        }
        state.round = Round::new(dests, ping, None);
        state.attempts = 0;
        state.next_retransmit_ms = now_ms + self.backoff(0);
        state.round.send_pending()
    }

    /// A REPL_PING_ACK arrived.
    pub fn on_ping_ack(&self, from: NodeId, tid: u64, code: ResultCode) -> Vec<Action> {
        let mut state = self.state.lock();
        if state.tid != tid || state.phase != Phase::Ping {
            return Vec::new();
        }
        let Some(ix) = state.round.index_of(from) else {
            return Vec::new();
        };
        if code != ResultCode::Ok {
            return state.finish_failed(code);
        }
        state.round.acked.insert(ix);
        if state.round.is_complete() {
            state.finish_done()
        } else {
            Vec::new()
        }
    }

    // ========================================================================
    // Timer, failure, abandonment
    // ========================================================================

    /// Retransmit tick.
    pub fn on_timer(&self, now_ms: u64) -> Vec<Action> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Done
            | Phase::Failed(_)
            | Phase::DupRes(DupResPhase::TimedOut)
            | Phase::DupRes(DupResPhase::Querying)
            | Phase::DupRes(DupResPhase::Resolved)
            | Phase::Repl(ReplPhase::Preparing)
            | Phase::Repl(ReplPhase::Sending) => return Vec::new(),
            _ => {}
        }
        // A ping that has not been started has no round yet.
        if state.round.dests.is_empty() {
            return Vec::new();
        }

        let expired = now_ms.saturating_sub(self.started_ms) >= self.timing.transaction_max_ms;
        if !expired && now_ms < state.next_retransmit_ms {
            return Vec::new();
        }
        if expired || state.attempts >= self.timing.max_retries {
            tracing::debug!(
                id = %self.id,
                key = %self.key,
                attempts = state.attempts,
                "transaction timed out"
            );
            if state.phase == Phase::DupRes(DupResPhase::Collecting) {
                state.phase = Phase::DupRes(DupResPhase::TimedOut);
            }
            return state.finish_failed(ResultCode::Timeout);
        }

        state.attempts += 1;
        state.next_retransmit_ms = now_ms + self.backoff(state.attempts);
        state.round.send_pending()
    }

    /// Terminate with `code`.
    pub fn fail(&self, code: ResultCode) -> Vec<Action> {
        self.state.lock().finish_failed(code)
    }

    /// Suppress the client response. The transaction still runs to a
    /// terminal phase. Returns false if it had already answered.
    pub fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        state.abandoned = true;
        state.origin.take();
        !state.responded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Digest;

    fn timing() -> TransactionConfig {
        TransactionConfig {
            retransmit_ms: 100,
            max_retries: 2,
            transaction_max_ms: 10_000,
            registry_shards: 8,
            max_reresolves: 1,
        }
    }

    fn key() -> RequestKey {
        RequestKey::new(0, Digest([4; 20]))
    }

    fn plan(dests: Vec<NodeId>) -> ReplPlan {
        ReplPlan {
            tid: 9,
            dests,
            message: RwMessage::keyed(RwOp::ReplWrite, &key(), 9),
            full_message: None,
            response: WriteResponse {
                result: ResultCode::Ok,
                generation: 6,
                last_update_time: 1_000,
                void_time: 0,
            },
            respond_early: false,
            no_reply: false,
            confirm: false,
            snapshot: None,
            prior: None,
        }
    }

    fn request() -> (RwRequest, oneshot::Receiver<WriteResponse>) {
        let (tx, rx) = oneshot::channel();
        let write = WriteRequest::new("test", key().digest);
        (RwRequest::write(key(), write, Some(tx), 0, &timing()), rx)
    }

    fn sends(actions: &[Action]) -> Vec<NodeId> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn acks_complete_round() {
        let (req, mut rx) = request();
        let actions = req.begin_replication(plan(vec![2, 3]), 0);
        assert_eq!(sends(&actions), vec![2, 3]);
        assert!(req.on_write_ack(2, 9, ResultCode::Ok, 10).is_empty());
        let actions = req.on_write_ack(3, 9, ResultCode::Ok, 10);
        assert_eq!(
            actions,
            vec![Action::Complete {
                result: ResultCode::Ok
            }]
        );
        assert_eq!(req.phase(), Phase::Done);
        assert_eq!(rx.try_recv().unwrap().generation, 6);
    }

    #[test]
    fn stale_tid_is_ignored() {
        let (req, _rx) = request();
        req.begin_replication(plan(vec![2]), 0);
        assert!(req.on_write_ack(2, 8, ResultCode::Ok, 10).is_empty());
        assert_eq!(req.phase(), Phase::Repl(ReplPhase::AwaitingAcks));
    }

    #[test]
    fn timer_resends_only_unacked_then_times_out() {
        let (req, mut rx) = request();
        req.begin_replication(plan(vec![2, 3]), 0);
        req.on_write_ack(2, 9, ResultCode::Ok, 10);

        assert!(req.on_timer(50).is_empty());
        assert_eq!(sends(&req.on_timer(100)), vec![3]);
        assert_eq!(req.sends_to(3), 2);
        assert_eq!(req.sends_to(2), 1);
        // Backoff doubles: next retransmit at 100 + 200.
        assert!(req.on_timer(250).is_empty());
        assert_eq!(sends(&req.on_timer(300)), vec![3]);

        let actions = req.on_timer(10_000);
        assert_eq!(
            actions,
            vec![
                Action::Unwind {
                    last_update_time: 1_000
                },
                Action::Complete {
                    result: ResultCode::Timeout
                }
            ]
        );
        assert_eq!(rx.try_recv().unwrap().result, ResultCode::Timeout);
    }

    #[test]
    fn commit_master_answers_before_acks() {
        let (req, mut rx) = request();
        let mut p = plan(vec![2]);
        p.respond_early = true;
        req.begin_replication(p, 0);
        assert_eq!(rx.try_recv().unwrap().result, ResultCode::Ok);
        assert_eq!(req.phase(), Phase::Repl(ReplPhase::AwaitingAcks));
        req.on_write_ack(2, 9, ResultCode::Ok, 1);
        assert_eq!(req.phase(), Phase::Done);
    }

    #[test]
    fn no_reply_finishes_immediately() {
        let (req, mut rx) = request();
        let mut p = plan(vec![2, 3]);
        p.no_reply = true;
        let actions = req.begin_replication(p, 0);
        assert_eq!(sends(&actions), vec![2, 3]);
        assert!(matches!(actions.last(), Some(Action::Complete { .. })));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn confirm_round_follows_acks() {
        let (req, _rx) = request();
        let mut p = plan(vec![2]);
        p.confirm = true;
        req.begin_replication(p, 0);
        let actions = req.on_write_ack(2, 9, ResultCode::Ok, 5);
        assert_eq!(req.phase(), Phase::Repl(ReplPhase::Confirming));
        match &actions[0] {
            Action::Send { to, msg } => {
                assert_eq!(*to, 2);
                assert_eq!(msg.op, RwOp::ReplConfirm);
                assert_eq!(msg.last_update_time, Some(1_000));
            }
            other => panic!("unexpected {:?}", other),
        }
        let actions = req.on_confirm_reply(2, 9, ResultCode::Ok);
        assert_eq!(
            actions[0],
            Action::MarkReplicated {
                last_update_time: 1_000
            }
        );
        assert_eq!(req.phase(), Phase::Done);
    }

    #[test]
    fn lost_conflict_reresolves_once() {
        let (req, mut rx) = request();
        req.begin_replication(plan(vec![2]), 0);
        let actions = req.on_write_ack(2, 9, ResultCode::LostConflict, 1);
        assert_eq!(actions, vec![Action::Reresolve { dests: vec![2] }]);
        assert_eq!(req.reresolves(), 1);

        req.begin_replication(plan(vec![2]), 2);
        let actions = req.on_write_ack(2, 9, ResultCode::LostConflict, 3);
        assert_eq!(
            actions,
            vec![
                Action::Unwind {
                    last_update_time: 1_000
                },
                Action::Complete {
                    result: ResultCode::LostConflict
                }
            ]
        );
        assert_eq!(rx.try_recv().unwrap().result, ResultCode::LostConflict);
    }

    #[test]
    fn replica_failure_unwinds_unanswered_write() {
        let (req, mut rx) = request();
        req.begin_replication(plan(vec![2]), 0);
        let actions = req.on_write_ack(2, 9, ResultCode::Forbidden, 1);
        assert_eq!(
            actions[0],
            Action::Unwind {
                last_update_time: 1_000
            }
        );
        assert_eq!(rx.try_recv().unwrap().result, ResultCode::Forbidden);
    }

    #[test]
    fn early_answer_keeps_the_write_on_failure() {
        let (req, _rx) = request();
        let mut p = plan(vec![2]);
        p.respond_early = true;
        req.begin_replication(p, 0);
        let actions = req.on_timer(10_000);
        assert_eq!(
            actions,
            vec![Action::Complete {
                result: ResultCode::Timeout
            }]
        );
    }

    #[test]
    fn abandoned_request_still_completes_silently() {
        let (req, mut rx) = request();
        req.begin_replication(plan(vec![2]), 0);
        assert!(req.abandon());
        let actions = req.on_write_ack(2, 9, ResultCode::Ok, 1);
        assert!(matches!(actions[0], Action::Complete { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dup_res_times_out() {
        let (req, mut rx) = request();
        let query = RwMessage::keyed(RwOp::Dup, &key(), 4);
        let actions = req.start_dup_res(4, vec![5], DupCandidate::absent(1), TieBreak::Generation, query, 0);
        assert_eq!(sends(&actions), vec![5]);
        assert_eq!(req.phase(), Phase::DupRes(DupResPhase::Collecting));
        assert_eq!(sends(&req.on_timer(100)), vec![5]);
        assert_eq!(sends(&req.on_timer(300)), vec![5]);
        req.on_timer(700);
        assert_eq!(req.phase(), Phase::DupRes(DupResPhase::TimedOut));
        assert_eq!(rx.try_recv().unwrap().result, ResultCode::Timeout);
    }
}
