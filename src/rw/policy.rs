//! Record merge and unwind policy.
//!
//! Pure decision functions shared by the coordinating and receiving sides.
//! Nothing here performs I/O; callers own storage and messaging.

use super::{GenerationPolicy, WriteRequest};
use crate::core::config::{CommitLevel, ConflictResolutionPolicy, NamespaceConfig};
use crate::core::error::{KeystoneError, KeystoneResult};
use crate::record::{Bin, Particle, Record, RecordMetadata, RequestKey};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Use the namespace default TTL.
pub const TTL_NAMESPACE_DEFAULT: u32 = 0;

/// Never expire.
pub const TTL_NEVER_EXPIRE: u32 = u32::MAX;

/// Keep the record's current expiration.
pub const TTL_DONT_UPDATE: u32 = u32::MAX - 1;

/// Largest explicit TTL accepted, in seconds (ten years).
pub const MAX_ALLOWED_TTL: u32 = 315_360_000;

// ============================================================================
// Client expectations
// ============================================================================

/// Compare-and-set on generation. Only consulted when the record exists.
pub fn generation_check(current: u16, policy: GenerationPolicy) -> KeystoneResult<()> {
    let ok = match policy {
        GenerationPolicy::None => true,
        GenerationPolicy::Eq(expected) => current == expected,
        GenerationPolicy::Gt(expected) => expected > current,
    };
    if ok {
        Ok(())
    } else {
        Err(KeystoneError::GenerationMismatch {
            current,
            expected: policy.expected().unwrap_or_default(),
        })
    }
}

/// Generation following `generation`. Zero is skipped on wrap.
pub fn next_generation(generation: u16) -> u16 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Order generations on the 16-bit ring. `a` is ahead of `b` when it is
/// fewer than half the ring past it, so 1 follows 65535.
pub fn generation_cmp(a: u16, b: u16) -> Ordering {
    (a.wrapping_sub(b) as i16).cmp(&0)
}

/// A record's set, once established, cannot change.
pub fn set_name_check(record: &Record, request_set: Option<&str>) -> KeystoneResult<()> {
    match (record.set_name.as_deref(), request_set) {
        (Some(current), Some(requested)) if current != requested => {
            Err(KeystoneError::SetMismatch {
                record_set: Some(current.to_string()),
                request_set: requested.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Adopt the request's set on a record that has none.
pub fn set_set_from_msg(record: &mut Record, request_set: Option<&str>) {
    if record.set_name.is_none() {
        record.set_name = request_set.map(str::to_string);
    }
}

// ============================================================================
// TTL
// ============================================================================

/// TTL within bounds or one of the sentinels.
pub fn is_valid_ttl(ttl: u32) -> bool {
    ttl <= MAX_ALLOWED_TTL || ttl == TTL_NEVER_EXPIRE || ttl == TTL_DONT_UPDATE
}

/// Positive TTL on a namespace with no expiration sweep.
pub fn is_ttl_disallowed(ttl: u32, ns: &NamespaceConfig) -> bool {
    // Sentinels above i32::MAX read as negative and never count as positive.
    let positive = (ttl as i32) > 0 || (ttl == TTL_NAMESPACE_DEFAULT && ns.default_ttl != 0);
    positive && ns.nsup_period == 0 && !ns.allow_ttl_without_nsup
}

/// Void time for `ttl`. `current` is the record's void time, if it exists.
pub fn void_time_for_ttl(ttl: u32, ns: &NamespaceConfig, now_secs: u32, current: Option<u32>) -> u32 {
    let from_ttl = |ttl: u32| match ttl {
        0 => 0,
        ttl => now_secs.saturating_add(ttl),
    };
    match ttl {
        TTL_NEVER_EXPIRE => 0,
        TTL_DONT_UPDATE => current.unwrap_or_else(|| from_ttl(ns.default_ttl)),
        TTL_NAMESPACE_DEFAULT => from_ttl(ns.default_ttl),
        ttl => from_ttl(ttl),
    }
}

// ============================================================================
// Versioning
// ============================================================================

/// Stamp a new version: next generation and a LUT that never goes back.
pub fn advance_record_version(meta: &mut RecordMetadata, now_ms: u64) -> u64 {
    let lut = now_ms.max(meta.last_update_time + 1);
    meta.last_update_time = lut;
    meta.generation = next_generation(meta.generation);
    lut
}

/// Order two versions under a namespace conflict-resolution policy.
/// `Greater` means `incoming` supersedes `existing`.
pub fn compare_versions(
    policy: ConflictResolutionPolicy,
    incoming: &RecordMetadata,
    existing: &RecordMetadata,
) -> Ordering {
    match policy {
        ConflictResolutionPolicy::Generation => {
            generation_cmp(incoming.generation, existing.generation)
                .then(incoming.last_update_time.cmp(&existing.last_update_time))
        }
        ConflictResolutionPolicy::LastUpdateTime => incoming
            .last_update_time
            .cmp(&existing.last_update_time)
            .then(generation_cmp(incoming.generation, existing.generation)),
    }
}

// ============================================================================
// Bin resolution
// ============================================================================

/// Bin-level merge is refused when the incoming data carries bin LUTs but
/// the local record has live bins without them.
pub fn forbid_resolve(record: &Record, msg_lut: u64) -> bool {
    msg_lut != 0 && !record.meta.has_bin_meta && !record.is_empty()
}

/// Apply an incoming bin value stamped `msg_lut`. The value survives only
/// if it is newer than the local bin; survivors bump `n_won`.
pub fn resolve_bin(
    record: &mut Record,
    name: &str,
    particle: &Particle,
    msg_lut: u64,
    n_won: &mut u32,
) -> bool {
    let has_bin_meta = record.meta.has_bin_meta;
    let incoming = Bin::new(name, particle.clone(), if has_bin_meta { msg_lut } else { 0 });
    if has_bin_meta {
        if let Some(existing) = record.bin(name) {
            if incoming.version_cmp(existing) != Ordering::Greater {
                return false;
            }
        }
    }
    record.put_bin(incoming);
    *n_won += 1;
    true
}

/// Apply an incoming bin deletion stamped `msg_lut`. With bin metadata the
/// bin becomes a tombstone; otherwise it is removed. Displaced versions go
/// to `cleanup`.
pub fn delete_bin(record: &mut Record, name: &str, msg_lut: u64, cleanup: &mut Vec<Bin>) -> bool {
    if record.meta.has_bin_meta {
        let tombstone = Bin::tombstone(name, msg_lut);
        if let Some(existing) = record.bin(name) {
            if tombstone.version_cmp(existing) != Ordering::Greater {
                return false;
            }
        }
        if let Some(old) = record.put_bin(tombstone) {
            cleanup.push(old);
        }
        return true;
    }
    match record.remove_bin(name) {
        Some(old) => {
            cleanup.push(old);
            true
        }
        None => false,
    }
}

/// UDF bin write. UDF output is authoritative locally, so it only loses to
/// a bin stamped later than the record's new version.
pub fn udf_resolve_bin(record: &mut Record, name: &str, particle: &Particle, lut: u64) -> bool {
    let has_bin_meta = record.meta.has_bin_meta;
    if has_bin_meta && record.bin(name).is_some_and(|b| b.lut > lut) {
        return false;
    }
    record.put_bin(Bin::new(name, particle.clone(), if has_bin_meta { lut } else { 0 }));
    true
}

/// UDF bin deletion. Deleting a bin the record does not hold is a no-op.
pub fn udf_delete_bin(record: &mut Record, name: &str, lut: u64, cleanup: &mut Vec<Bin>) -> bool {
    match record.bin(name) {
        Some(bin) if !bin.is_tombstone() => delete_bin(record, name, lut, cleanup),
        _ => false,
    }
}

/// Merge every bin of `other` into `record`, keeping the newer version of
/// each. Returns the number of bins `other` won. Nothing is merged into a
/// record whose live bins carry no LUTs.
pub fn merge_bins(record: &mut Record, other: &Record) -> u32 {
    let newest = other.bins.iter().map(|b| b.lut).max().unwrap_or(0);
    if forbid_resolve(record, newest) {
        return 0;
    }
    let mut n_won = 0;
    let mut cleanup = Vec::new();
    for bin in &other.bins {
        match bin.particle {
            Some(ref particle) => {
                resolve_bin(record, &bin.name, particle, bin.lut, &mut n_won);
            }
            None => {
                if delete_bin(record, &bin.name, bin.lut, &mut cleanup) {
                    n_won += 1;
                }
            }
        }
    }
    n_won
}

// ============================================================================
// Delete handling
// ============================================================================

/// Non-durable record delete: the record is dropped, not tombstoned.
pub fn write_is_full_drop(request: &WriteRequest) -> bool {
    request.delete && !request.durable_delete
}

/// Update delete-related flags for a new version.
pub fn transition_delete_metadata(meta: &mut RecordMetadata, is_delete: bool, is_bin_cemetery: bool) {
    if is_delete {
        let ext = meta.ext_mut();
        ext.tombstone = true;
        ext.xdr_bin_cemetery = is_bin_cemetery;
        meta.void_time = 0;
    } else if let Some(ext) = meta.ext.as_mut() {
        ext.tombstone = false;
        ext.cenotaph = false;
        ext.xdr_tombstone = false;
        ext.xdr_nsup_tombstone = false;
        ext.xdr_bin_cemetery = false;
    }
}

/// Deletes report no surviving generation or expiration.
pub fn clear_delete_response_metadata(response: &mut super::WriteResponse) {
    response.generation = 0;
    response.last_update_time = 0;
    response.void_time = 0;
}

/// Whether the client is answered as soon as the master's write is durable.
pub fn respond_on_master_complete(request: &WriteRequest, ns: &NamespaceConfig) -> bool {
    request.commit_level.unwrap_or(ns.write_commit_level) == CommitLevel::Master
}

// ============================================================================
// Pickles
// ============================================================================

/// Shape of a pickled mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PickleKind {
    /// Whole record.
    Full,
    /// Touched bins only, valid on top of the version identified by
    /// `base` (generation, LUT). `None` means the record was created.
    Delta {
        base: Option<(u16, u64)>,
        removed: Vec<String>,
    },
    /// The record is dropped.
    Drop,
}

/// Replicate-ready encoding of an applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pickle {
    pub meta: RecordMetadata,
    pub set_name: Option<String>,
    pub kind: PickleKind,
    pub bins: Vec<Bin>,
}

/// Why a pickle could not be applied to a replica's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseMismatch;

impl Pickle {
    /// Pickle of a dropped record.
    pub fn drop_record(meta: RecordMetadata, set_name: Option<String>) -> Self {
        Self {
            meta,
            set_name,
            kind: PickleKind::Drop,
            bins: Vec::new(),
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self.kind, PickleKind::Drop)
    }

    pub fn is_full(&self) -> bool {
        matches!(self.kind, PickleKind::Full)
    }

    pub fn encode(&self) -> KeystoneResult<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| KeystoneError::wire(format!("pickle encode: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> KeystoneResult<Self> {
        bincode::deserialize(bytes).map_err(|e| KeystoneError::wire(format!("pickle decode: {}", e)))
    }

    /// Materialize the record a replica should hold, given its current copy.
    /// Dropped records have no result and are handled by the caller.
    pub fn apply_to(&self, key: RequestKey, existing: Option<&Record>) -> Result<Record, BaseMismatch> {
        match &self.kind {
            PickleKind::Full | PickleKind::Drop => Ok(Record {
                key,
                set_name: self.set_name.clone(),
                meta: self.meta,
                bins: self.bins.clone(),
            }),
            PickleKind::Delta { base, removed } => {
                let found = existing.map(|r| (r.meta.generation, r.meta.last_update_time));
                if found != *base {
                    return Err(BaseMismatch);
                }
                let mut record = existing.cloned().unwrap_or_else(|| Record::new(key));
                for bin in &self.bins {
                    record.put_bin(bin.clone());
                }
                for name in removed {
                    record.remove_bin(name);
                }
                record.meta = self.meta;
                record.set_name = self.set_name.clone();
                Ok(record)
            }
        }
    }
}

/// Pickle the mutation that produced `record`.
///
/// `before` is the pre-mutation metadata (`None` for a created record) and
/// `touched` the bins the mutation wrote or deleted. A delta is produced
/// unless `full` is set.
pub fn pickle_all(record: &Record, before: Option<&RecordMetadata>, touched: &[String], full: bool) -> Pickle {
    if full {
        return Pickle {
            meta: record.meta,
            set_name: record.set_name.clone(),
            kind: PickleKind::Full,
            bins: record.bins.clone(),
        };
    }
    let bins = record
        .bins
        .iter()
        .filter(|b| touched.contains(&b.name))
        .cloned()
        .collect();
    let removed = touched
        .iter()
        .filter(|name| record.bin(name).is_none())
        .cloned()
        .collect();
    Pickle {
        meta: record.meta,
        set_name: record.set_name.clone(),
        kind: PickleKind::Delta {
            base: before.map(|m| (m.generation, m.last_update_time)),
            removed,
        },
        bins,
    }
}
