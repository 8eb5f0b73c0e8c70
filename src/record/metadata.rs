//! Record index metadata and the pre-mutation snapshot.

use serde::{Deserialize, Serialize};

/// Replication state of a record copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplState {
    /// Settled on every replica.
    #[default]
    Replicated,
    /// Written but not yet confirmed by the coordinator.
    Unreplicated,
}

/// Enterprise-edition metadata.
///
/// Attached to [`RecordMetadata`] only when a build populates it; a
/// community build leaves `RecordMetadata::ext` as `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnterpriseMeta {
    pub xdr_write: bool,
    pub tombstone: bool,
    pub cenotaph: bool,
    pub xdr_tombstone: bool,
    pub xdr_nsup_tombstone: bool,
    pub xdr_bin_cemetery: bool,
    pub repl_state: ReplState,
}

/// Index metadata of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Expiration, seconds since the citrusleaf epoch. Zero never expires.
    pub void_time: u32,
    /// Milliseconds since the citrusleaf epoch.
    pub last_update_time: u64,
    pub generation: u16,
    /// Bins carry their own LUTs.
    pub has_bin_meta: bool,
    pub ext: Option<EnterpriseMeta>,
}

impl RecordMetadata {
    /// Metadata for a fresh version.
    pub fn new(generation: u16, last_update_time: u64, void_time: u32) -> Self {
        Self {
            void_time,
            last_update_time,
            generation,
            has_bin_meta: false,
            ext: None,
        }
    }

    /// Extension record, created on first use.
    pub fn ext_mut(&mut self) -> &mut EnterpriseMeta {
        self.ext.get_or_insert_with(EnterpriseMeta::default)
    }

    pub fn is_tombstone(&self) -> bool {
        self.ext.is_some_and(|e| e.tombstone)
    }

    pub fn is_cenotaph(&self) -> bool {
        self.ext.is_some_and(|e| e.cenotaph)
    }

    pub fn is_unreplicated(&self) -> bool {
        self.ext
            .is_some_and(|e| e.repl_state == ReplState::Unreplicated)
    }

    /// Whether the record has expired at `now_secs`.
    pub fn is_expired_at(&self, now_secs: u32) -> bool {
        self.void_time != 0 && self.void_time <= now_secs
    }
}

/// Immutable before-value captured at mutation start.
///
/// Restoring it puts the metadata back exactly as it was; see
/// [`crate::record::MutationGuard`] for the scope that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataSnapshot {
    before: RecordMetadata,
}

impl MetadataSnapshot {
    /// Stash the current metadata.
    pub fn capture(meta: &RecordMetadata) -> Self {
        Self { before: *meta }
    }

    /// Unwind `meta` to the captured value.
    pub fn restore(&self, meta: &mut RecordMetadata) {
        *meta = self.before;
    }

    /// The captured value.
    pub fn metadata(&self) -> &RecordMetadata {
        &self.before
    }
}
