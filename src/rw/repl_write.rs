//! Replica writes: destination checks, ack classification and the
//! receiving side's apply decision.

use super::policy::{compare_versions, BaseMismatch, Pickle};
use crate::core::config::ConflictResolutionPolicy;
use crate::core::error::ResultCode;
use crate::record::{Record, RequestKey};
use crate::wire::InfoFlags;
use std::cmp::Ordering;

/// Phase of the replica-write round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplPhase {
    Preparing,
    Sending,
    AwaitingAcks,
    Confirming,
}

/// Enough reachable destinations for the namespace durability policy.
pub fn sufficient_replica_destinations(n_dests: usize, required_replicas: u32) -> bool {
    n_dests >= required_replicas as usize
}

/// What the coordinator does with a WRITE_ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplVerdict {
    /// Destination holds the write.
    Ack,
    /// Transient; resend on the next retransmit.
    Retransmit,
    /// Destination could not apply the delta; send the whole record.
    ResendFull,
    /// Destination holds a newer version. Restart via duplicate resolution.
    Reresolve,
    /// Give up with this code.
    Fail(ResultCode),
}

/// Classify a replica's reply code.
pub fn should_retransmit_replicas(code: ResultCode) -> ReplVerdict {
    match code {
        ResultCode::Ok => ReplVerdict::Ack,
        ResultCode::Timeout
        | ResultCode::KeyBusy
        | ResultCode::ClusterKeyMismatch
        | ResultCode::DeviceOverload => ReplVerdict::Retransmit,
        ResultCode::Generation => ReplVerdict::ResendFull,
        ResultCode::LostConflict => ReplVerdict::Reresolve,
        other => ReplVerdict::Fail(other),
    }
}

/// Whether a REPL_WRITE expects an answer.
pub fn replica_ack_required(info: InfoFlags) -> bool {
    !info.contains(InfoFlags::NO_REPL_ACK)
}

/// Sender regime older than the replica's view of the partition.
pub fn regime_is_stale(local_regime: u32, msg_regime: Option<u32>) -> bool {
    msg_regime.is_some_and(|r| r < local_regime)
}

/// Code a replica answers a REPL_PING with.
pub fn ping_reply_code(local_regime: u32, msg_regime: Option<u32>) -> ResultCode {
    match msg_regime {
        Some(r) if r == local_regime => ResultCode::Ok,
        _ => ResultCode::ClusterKeyMismatch,
    }
}

/// Replica-side outcome of an inbound REPL_WRITE.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaDecision {
    /// Store this record.
    Store(Record),
    /// Remove the local copy.
    Drop,
    /// Already applied or truncated on arrival; answer OK, change nothing.
    Ignore,
    /// Refuse with this code.
    Reject(ResultCode),
}

/// Decide what a replica does with an inbound pickle.
///
/// `existing` must already exclude truncated copies. The version order is
/// the namespace conflict-resolution policy, the same rule the master uses.
pub fn decide_replica_write(
    key: RequestKey,
    existing: Option<&Record>,
    pickle: &Pickle,
    policy: ConflictResolutionPolicy,
    incoming_truncated: bool,
    regime_stale: bool,
) -> ReplicaDecision {
    if regime_stale {
        return ReplicaDecision::Reject(ResultCode::ClusterKeyMismatch);
    }
    if incoming_truncated {
        return ReplicaDecision::Ignore;
    }
    if let Some(current) = existing {
        match compare_versions(policy, &pickle.meta, &current.meta) {
            Ordering::Less => return ReplicaDecision::Reject(ResultCode::LostConflict),
            Ordering::Equal => return ReplicaDecision::Ignore,
            Ordering::Greater => {}
        }
    }
    if pickle.is_drop() {
        return ReplicaDecision::Drop;
    }
    match pickle.apply_to(key, existing) {
        Ok(record) => ReplicaDecision::Store(record),
        Err(BaseMismatch) => ReplicaDecision::Reject(ResultCode::Generation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Bin, Digest, Particle, RecordMetadata};
    use crate::rw::policy::pickle_all;

    fn key() -> RequestKey {
        RequestKey::new(0, Digest([9; 20]))
    }

    fn version(generation: u16, lut: u64) -> Record {
        let mut record = Record::new(key());
        record.meta = RecordMetadata::new(generation, lut, 0);
        record.put_bin(Bin::new("v", Particle::Integer(generation as i64), 0));
        record
    }

    #[test]
    fn verdicts() {
        assert_eq!(should_retransmit_replicas(ResultCode::Ok), ReplVerdict::Ack);
        assert_eq!(
            should_retransmit_replicas(ResultCode::KeyBusy),
            ReplVerdict::Retransmit
        );
        assert_eq!(
            should_retransmit_replicas(ResultCode::LostConflict),
            ReplVerdict::Reresolve
        );
        assert_eq!(
            should_retransmit_replicas(ResultCode::Generation),
            ReplVerdict::ResendFull
        );
        assert_eq!(
            should_retransmit_replicas(ResultCode::Forbidden),
            ReplVerdict::Fail(ResultCode::Forbidden)
        );
    }

    #[test]
    fn destination_count_check() {
        assert!(sufficient_replica_destinations(2, 2));
        assert!(!sufficient_replica_destinations(1, 2));
        assert!(sufficient_replica_destinations(0, 0));
    }

    #[test]
    fn newer_incoming_is_stored() {
        let current = version(3, 100);
        let incoming = pickle_all(&version(4, 200), None, &[], true);
        assert!(matches!(
            decide_replica_write(
                key(),
                Some(&current),
                &incoming,
                ConflictResolutionPolicy::Generation,
                false,
                false
            ),
            ReplicaDecision::Store(_)
        ));
    }

    #[test]
    fn older_incoming_loses_and_duplicate_is_ignored() {
        let current = version(5, 300);
        let older = pickle_all(&version(4, 200), None, &[], true);
        assert_eq!(
            decide_replica_write(
                key(),
                Some(&current),
                &older,
                ConflictResolutionPolicy::LastUpdateTime,
                false,
                false
            ),
            ReplicaDecision::Reject(ResultCode::LostConflict)
        );
        let same = pickle_all(&current, None, &[], true);
        assert_eq!(
            decide_replica_write(
                key(),
                Some(&current),
                &same,
                ConflictResolutionPolicy::Generation,
                false,
                false
            ),
            ReplicaDecision::Ignore
        );
    }

    #[test]
    fn stale_regime_and_truncation() {
        let incoming = pickle_all(&version(1, 10), None, &[], true);
        assert_eq!(
            decide_replica_write(
                key(),
                None,
                &incoming,
                ConflictResolutionPolicy::Generation,
                false,
                true
            ),
            ReplicaDecision::Reject(ResultCode::ClusterKeyMismatch)
        );
        assert_eq!(
            decide_replica_write(
                key(),
                None,
                &incoming,
                ConflictResolutionPolicy::Generation,
                true,
                false
            ),
            ReplicaDecision::Ignore
        );
        assert!(regime_is_stale(3, Some(2)));
        assert!(!regime_is_stale(3, Some(4)));
        assert!(!regime_is_stale(3, None));
        assert_eq!(ping_reply_code(3, Some(3)), ResultCode::Ok);
        assert_eq!(ping_reply_code(3, Some(2)), ResultCode::ClusterKeyMismatch);
    }

    #[test]
    fn delta_on_wrong_base_asks_for_full() {
        let base = version(1, 10);
        let mut next = base.clone();
        next.meta = RecordMetadata::new(2, 20, 0);
        let delta = pickle_all(&next, Some(&base.meta), &["v".to_string()], false);
        let unrelated = version(1, 15);
        assert_eq!(
            decide_replica_write(
                key(),
                Some(&unrelated),
                &delta,
                ConflictResolutionPolicy::Generation,
                false,
                false
            ),
            ReplicaDecision::Reject(ResultCode::Generation)
        );
    }

    #[test]
    fn no_repl_ack_flag() {
        assert!(replica_ack_required(InfoFlags::UNREPLICATED));
        assert!(!replica_ack_required(InfoFlags::NO_REPL_ACK));
    }
}
