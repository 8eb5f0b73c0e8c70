//! Duplicate resolution.
//!
//! When the master cannot trust its own copy (after an ownership change the
//! partition map lists `dup_nodes`), it queries every candidate holder and
//! keeps the version ranked highest by [`rank`]. The rank is a total order,
//! so any coordinator holding the same candidate set picks the same winner
//! regardless of reply arrival order.

use super::policy::{merge_bins, Pickle};
use crate::cluster::NodeId;
use crate::core::config::TieBreak;
use crate::core::error::ResultCode;
use crate::record::{Record, RecordMetadata};

/// Phase of a duplicate-resolution round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupResPhase {
    Querying,
    Collecting,
    Resolved,
    TimedOut,
}

/// One node's version of the record.
#[derive(Debug, Clone, PartialEq)]
pub struct DupCandidate {
    pub node: NodeId,
    /// `None` when the node holds no live copy.
    pub meta: Option<RecordMetadata>,
    /// Content, when the node shipped it.
    pub record: Option<Record>,
}

impl DupCandidate {
    pub fn absent(node: NodeId) -> Self {
        Self {
            node,
            meta: None,
            record: None,
        }
    }
}

/// Total-order rank of a candidate. Any copy outranks no copy; then LUT,
/// then the configured secondary key, then node id.
///
/// `wrapped` rotates generations by half the ring so that a set of copies
/// straddling the 65535 -> 1 wrap still orders newest last. Pass the value
/// [`straddles_wrap`] computes over the whole candidate set.
pub fn rank(candidate: &DupCandidate, tie_break: TieBreak, wrapped: bool) -> (bool, u64, u16, NodeId) {
    match candidate.meta {
        None => (false, 0, 0, candidate.node),
        Some(meta) => {
            let secondary = match tie_break {
                TieBreak::Generation if wrapped => meta.generation.wrapping_add(GENERATION_HALF_RING),
                TieBreak::Generation => meta.generation,
                TieBreak::NodeId => 0,
            };
            (true, meta.last_update_time, secondary, candidate.node)
        }
    }
}

const GENERATION_HALF_RING: u16 = 0x8000;

/// Whether the candidates' generations sit on both sides of the wrap.
/// Depends only on the set, not on arrival order.
pub fn straddles_wrap(candidates: &[DupCandidate]) -> bool {
    let gens = || candidates.iter().filter_map(|c| c.meta.map(|m| m.generation));
    gens().any(|g| g >= 0xC000) && gens().any(|g| g < 0x4000)
}

/// Highest-ranked candidate.
pub fn pick_winner(candidates: &[DupCandidate], tie_break: TieBreak) -> Option<&DupCandidate> {
    let wrapped = straddles_wrap(candidates);
    candidates.iter().max_by_key(|c| rank(c, tie_break, wrapped))
}

/// Two copies that only the node id separates.
pub fn is_exact_tie(a: &DupCandidate, b: &DupCandidate, tie_break: TieBreak) -> bool {
    let (ra, rb) = (rank(a, tie_break, false), rank(b, tie_break, false));
    ra.0 && rb.0 && ra.1 == rb.1 && ra.2 == rb.2
}

/// Whether a reply code is worth asking the same node again.
pub fn should_retry(code: ResultCode) -> bool {
    matches!(
        code,
        ResultCode::KeyBusy
            | ResultCode::Timeout
            | ResultCode::ClusterKeyMismatch
            | ResultCode::DeviceOverload
    )
}

/// Client-facing code for a failed resolution.
pub fn translate_result_code(code: ResultCode) -> ResultCode {
    match code {
        ResultCode::ClusterKeyMismatch => ResultCode::Unavailable,
        ResultCode::Timeout
        | ResultCode::KeyBusy
        | ResultCode::DeviceOverload
        | ResultCode::Forbidden => code,
        _ => ResultCode::Unknown,
    }
}

/// Merge exactly tied copies bin by bin instead of querying again.
///
/// The highest-ranked copy is the base; every other tied copy contributes
/// bins that are newer per bin LUT. Without bin metadata there is nothing
/// to merge on and the ranked winner stands. Returns the merged record and
/// the number of bins taken from the other copies.
pub fn handle_tie(tied: &[&DupCandidate], tie_break: TieBreak) -> Option<(Record, u32)> {
    let winner = tied.iter().max_by_key(|c| rank(c, tie_break, false))?;
    let mut merged = winner.record.clone()?;
    if !merged.meta.has_bin_meta {
        return Some((merged, 0));
    }
    let mut n_won = 0;
    for other in tied.iter().filter(|c| c.node != winner.node) {
        match other.record {
            Some(ref record) if record.meta.has_bin_meta => n_won += merge_bins(&mut merged, record),
            _ => {}
        }
    }
    Some((merged, n_won))
}

/// Result of a finished resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DupOutcome {
    pub winner_node: NodeId,
    /// Version to build on. `None` keeps the master's local copy.
    pub record: Option<Record>,
    /// An exact tie was merged.
    pub tie_merged: bool,
    /// Bins taken from non-winning tied copies.
    pub bins_won: u32,
}

/// Progress after a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum DupProgress {
    /// Still waiting on other nodes.
    Pending,
    /// The node should be asked again on the next retransmit.
    Retry,
    Resolved(DupOutcome),
    Failed(ResultCode),
}

/// Collected state of one resolution round.
#[derive(Debug, Clone)]
pub struct DupResolution {
    local_node: NodeId,
    nodes: Vec<NodeId>,
    replied: Vec<bool>,
    candidates: Vec<DupCandidate>,
    tie_break: TieBreak,
}

impl DupResolution {
    /// Round querying `nodes`, with the master's own copy as the first
    /// candidate.
    pub fn new(local: DupCandidate, nodes: Vec<NodeId>, tie_break: TieBreak) -> Self {
        let replied = vec![false; nodes.len()];
        Self {
            local_node: local.node,
            nodes,
            replied,
            candidates: vec![local],
            tie_break,
        }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Nodes that have not answered.
    pub fn pending(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .zip(&self.replied)
            .filter(|(_, replied)| !**replied)
            .map(|(node, _)| *node)
    }

    /// Record a DUP_ACK.
    pub fn on_reply(
        &mut self,
        from: NodeId,
        code: ResultCode,
        meta: Option<RecordMetadata>,
        record: Option<Record>,
    ) -> DupProgress {
        let Some(ix) = self.nodes.iter().position(|n| *n == from) else {
            return DupProgress::Pending;
        };
        if self.replied[ix] {
            return DupProgress::Pending;
        }
        match code {
            ResultCode::Ok => {
                self.replied[ix] = true;
                self.candidates.push(DupCandidate {
                    node: from,
                    meta,
                    record,
                });
            }
            ResultCode::NotFound => {
                self.replied[ix] = true;
                self.candidates.push(DupCandidate::absent(from));
            }
            code if should_retry(code) => return DupProgress::Retry,
            code => return DupProgress::Failed(translate_result_code(code)),
        }
        if self.replied.iter().all(|r| *r) {
            self.resolve()
        } else {
            DupProgress::Pending
        }
    }

    /// Pick the winner from everything collected.
    pub fn resolve(&self) -> DupProgress {
        let Some(winner) = pick_winner(&self.candidates, self.tie_break) else {
            return DupProgress::Failed(ResultCode::Unknown);
        };
        let tied: Vec<&DupCandidate> = self
            .candidates
            .iter()
            .filter(|c| is_exact_tie(c, winner, self.tie_break))
            .collect();

        if tied.len() > 1 {
            let with_content: Vec<&DupCandidate> = tied
                .iter()
                .copied()
                .filter(|c| c.record.is_some() || c.node == self.local_node)
                .collect();
            let differs = with_content
                .windows(2)
                .any(|w| w[0].record.as_ref().map(|r| &r.bins) != w[1].record.as_ref().map(|r| &r.bins));
            if differs && with_content.iter().all(|c| c.record.is_some()) {
                if let Some((record, bins_won)) = handle_tie(&with_content, self.tie_break) {
                    return DupProgress::Resolved(DupOutcome {
                        winner_node: winner.node,
                        record: Some(record),
                        tie_merged: true,
                        bins_won,
                    });
                }
            }
        }

        if winner.node == self.local_node || winner.meta.is_none() {
            return DupProgress::Resolved(DupOutcome {
                winner_node: winner.node,
                record: None,
                tie_merged: false,
                bins_won: 0,
            });
        }
        match winner.record {
            Some(ref record) => DupProgress::Resolved(DupOutcome {
                winner_node: winner.node,
                record: Some(record.clone()),
                tie_merged: false,
                bins_won: 0,
            }),
            None => DupProgress::Failed(ResultCode::Unknown),
        }
    }
}

/// Answer to a DUP query.
#[derive(Debug, Clone, PartialEq)]
pub struct DupReply {
    pub code: ResultCode,
    pub meta: Option<RecordMetadata>,
    pub pickle: Option<Pickle>,
}

/// Build the reply to a DUP query. `local` must already exclude truncated
/// copies. Content ships when the local copy is at least as new as the
/// requester's, so the requester holds content for any candidate that can
/// win or tie.
pub fn dup_reply(local: Option<&Record>, requester_lut: Option<u64>) -> DupReply {
    let Some(record) = local else {
        return DupReply {
            code: ResultCode::NotFound,
            meta: None,
            pickle: None,
        };
    };
    let ship = requester_lut.map_or(true, |lut| record.meta.last_update_time >= lut);
    DupReply {
        code: ResultCode::Ok,
        meta: Some(record.meta),
        pickle: ship.then(|| super::policy::pickle_all(record, None, &[], true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Bin, Digest, Particle, RequestKey};

    fn copy(node: NodeId, lut: u64, generation: u16) -> DupCandidate {
        let mut record = Record::new(RequestKey::new(0, Digest([3; 20])));
        record.meta = RecordMetadata::new(generation, lut, 0);
        record.put_bin(Bin::new("n", Particle::Integer(node as i64), 0));
        DupCandidate {
            node,
            meta: Some(record.meta),
            record: Some(record),
        }
    }

    #[test]
    fn highest_lut_wins() {
        let candidates = vec![copy(1, 10, 9), copy(2, 20, 1), DupCandidate::absent(3)];
        assert_eq!(pick_winner(&candidates, TieBreak::Generation).unwrap().node, 2);
    }

    #[test]
    fn tie_breaks_by_generation_then_node() {
        let candidates = vec![copy(1, 10, 5), copy(2, 10, 4)];
        assert_eq!(pick_winner(&candidates, TieBreak::Generation).unwrap().node, 1);
        assert_eq!(pick_winner(&candidates, TieBreak::NodeId).unwrap().node, 2);
        let candidates = vec![copy(7, 10, 5), copy(3, 10, 5)];
        assert_eq!(pick_winner(&candidates, TieBreak::Generation).unwrap().node, 7);
    }

    #[test]
    fn tie_on_lut_respects_generation_wrap() {
        let candidates = vec![copy(1, 10, u16::MAX), copy(2, 10, 1)];
        assert!(straddles_wrap(&candidates));
        assert_eq!(pick_winner(&candidates, TieBreak::Generation).unwrap().node, 2);
        let reversed = vec![copy(2, 10, 1), copy(1, 10, u16::MAX)];
        assert_eq!(pick_winner(&reversed, TieBreak::Generation).unwrap().node, 2);
    }

    #[test]
    fn retry_classification() {
        assert!(should_retry(ResultCode::KeyBusy));
        assert!(should_retry(ResultCode::ClusterKeyMismatch));
        assert!(!should_retry(ResultCode::Generation));
        assert!(!should_retry(ResultCode::Unknown));
        assert_eq!(
            translate_result_code(ResultCode::ClusterKeyMismatch),
            ResultCode::Unavailable
        );
        assert_eq!(translate_result_code(ResultCode::Parameter), ResultCode::Unknown);
    }

    #[test]
    fn remote_winner_content_is_adopted() {
        let mut round = DupResolution::new(copy(1, 10, 1), vec![2, 3], TieBreak::Generation);
        let remote = copy(2, 30, 2);
        assert_eq!(
            round.on_reply(2, ResultCode::Ok, remote.meta, remote.record.clone()),
            DupProgress::Pending
        );
        assert_eq!(round.on_reply(3, ResultCode::KeyBusy, None, None), DupProgress::Retry);
        assert_eq!(round.pending().collect::<Vec<_>>(), vec![3]);
        match round.on_reply(3, ResultCode::NotFound, None, None) {
            DupProgress::Resolved(outcome) => {
                assert_eq!(outcome.winner_node, 2);
                assert_eq!(outcome.record, remote.record);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn local_winner_keeps_local_copy() {
        let mut round = DupResolution::new(copy(1, 50, 1), vec![2], TieBreak::Generation);
        let remote = copy(2, 30, 9);
        match round.on_reply(2, ResultCode::Ok, remote.meta, None) {
            DupProgress::Resolved(outcome) => {
                assert_eq!(outcome.winner_node, 1);
                assert!(outcome.record.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn terminal_reply_fails_round() {
        let mut round = DupResolution::new(DupCandidate::absent(1), vec![2], TieBreak::Generation);
        assert_eq!(
            round.on_reply(2, ResultCode::Parameter, None, None),
            DupProgress::Failed(ResultCode::Unknown)
        );
    }

    #[test]
    fn exact_tie_merges_bins() {
        let mut a = copy(1, 10, 3);
        let mut b = copy(2, 10, 3);
        for c in [&mut a, &mut b] {
            let record = c.record.as_mut().unwrap();
            record.meta.has_bin_meta = true;
            record.bins.clear();
        }
        a.record.as_mut().unwrap().put_bin(Bin::new("x", Particle::Integer(1), 8));
        a.record.as_mut().unwrap().put_bin(Bin::new("y", Particle::Integer(1), 9));
        b.record.as_mut().unwrap().put_bin(Bin::new("x", Particle::Integer(2), 9));
        b.record.as_mut().unwrap().put_bin(Bin::new("y", Particle::Integer(2), 7));
        a.meta = Some(a.record.as_ref().unwrap().meta);
        b.meta = Some(b.record.as_ref().unwrap().meta);

        let mut round = DupResolution::new(a, vec![2], TieBreak::Generation);
        match round.on_reply(2, ResultCode::Ok, b.meta, b.record.clone()) {
            DupProgress::Resolved(outcome) => {
                assert!(outcome.tie_merged);
                let merged = outcome.record.unwrap();
                assert_eq!(merged.value("x"), Some(&Particle::Integer(2)));
                assert_eq!(merged.value("y"), Some(&Particle::Integer(1)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reply_ships_content_only_when_at_least_as_new() {
        let local = copy(1, 10, 1).record.unwrap();
        assert_eq!(dup_reply(None, Some(5)).code, ResultCode::NotFound);
        assert!(dup_reply(Some(&local), Some(10)).pickle.is_some());
        assert!(dup_reply(Some(&local), Some(11)).pickle.is_none());
        assert!(dup_reply(Some(&local), None).pickle.is_some());
    }
}
