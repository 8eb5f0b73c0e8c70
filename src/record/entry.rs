//! In-memory record and the scoped mutation guard.

use super::bin::{Bin, Particle};
use super::digest::RequestKey;
use super::metadata::{MetadataSnapshot, RecordMetadata};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// A record as seen by the write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RequestKey,
    /// Set membership. Immutable once established.
    pub set_name: Option<String>,
    pub meta: RecordMetadata,
    pub bins: Vec<Bin>,
}

impl Record {
    /// Empty record with no metadata.
    pub fn new(key: RequestKey) -> Self {
        Self {
            key,
            set_name: None,
            meta: RecordMetadata::default(),
            bins: Vec::new(),
        }
    }

    /// Look up a bin, tombstones included.
    pub fn bin(&self, name: &str) -> Option<&Bin> {
        self.bins.iter().find(|b| b.name == name)
    }

    /// Value of a live bin.
    pub fn value(&self, name: &str) -> Option<&Particle> {
        self.bin(name).and_then(|b| b.particle.as_ref())
    }

    /// Bins that hold a value.
    pub fn live_bins(&self) -> impl Iterator<Item = &Bin> {
        self.bins.iter().filter(|b| !b.is_tombstone())
    }

    /// Replace or add a bin, returning the previous version.
    pub fn put_bin(&mut self, bin: Bin) -> Option<Bin> {
        match self.bins.iter_mut().find(|b| b.name == bin.name) {
            Some(slot) => Some(std::mem::replace(slot, bin)),
            None => {
                self.bins.push(bin);
                None
            }
        }
    }

    /// Physically remove a bin.
    pub fn remove_bin(&mut self, name: &str) -> Option<Bin> {
        let ix = self.bins.iter().position(|b| b.name == name)?;
        Some(self.bins.remove(ix))
    }

    /// Whether the record holds no live bins.
    pub fn is_empty(&self) -> bool {
        self.live_bins().next().is_none()
    }
}

/// Scope within which a record is mutated in place.
///
/// Captures the metadata, bins and set name on entry. Dropping the guard
/// without calling [`MutationGuard::commit`] restores all three, so every
/// early return or `?` out of the mutation scope unwinds it.
pub struct MutationGuard<'a> {
    record: &'a mut Record,
    meta_before: MetadataSnapshot,
    bins_before: Vec<Bin>,
    set_before: Option<String>,
    committed: bool,
}

impl<'a> MutationGuard<'a> {
    /// Begin mutating `record`.
    pub fn begin(record: &'a mut Record) -> Self {
        let meta_before = MetadataSnapshot::capture(&record.meta);
        let bins_before = record.bins.clone();
        let set_before = record.set_name.clone();
        Self {
            record,
            meta_before,
            bins_before,
            set_before,
            committed: false,
        }
    }

    /// Metadata as it was on entry.
    pub fn before(&self) -> &MetadataSnapshot {
        &self.meta_before
    }

    /// Bins as they were on entry.
    pub fn old_bins(&self) -> &[Bin] {
        &self.bins_before
    }

    /// Keep the mutation. Returns the bins as they were on entry.
    pub fn commit(mut self) -> Vec<Bin> {
        self.committed = true;
        std::mem::take(&mut self.bins_before)
    }

    fn unwind(&mut self) {
        self.meta_before.restore(&mut self.record.meta);
        self.record.bins = std::mem::take(&mut self.bins_before);
        self.record.set_name = self.set_before.take();
    }
}

impl Deref for MutationGuard<'_> {
    type Target = Record;

    fn deref(&self) -> &Record {
        self.record
    }
}

impl DerefMut for MutationGuard<'_> {
    fn deref_mut(&mut self) -> &mut Record {
        self.record
    }
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.unwind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::digest::Digest;

    fn record() -> Record {
        let mut rec = Record::new(RequestKey::new(0, Digest([7; 20])));
        rec.meta = RecordMetadata::new(5, 100, 0);
        rec.put_bin(Bin::new("a", Particle::Integer(1), 0));
        rec
    }

    fn replicate(ok: bool) -> Result<(), &'static str> {
        if ok {
            Ok(())
        } else {
            Err("replication failed")
        }
    }

    fn failing_mutation(rec: &mut Record) -> Result<(), &'static str> {
        let mut guard = MutationGuard::begin(rec);
        guard.meta.generation = 6;
        guard.set_name = Some("s".into());
        guard.put_bin(Bin::new("b", Particle::Integer(2), 0));
        replicate(false)?;
        guard.commit();
        Ok(())
    }

    #[test]
    fn drop_without_commit_unwinds() {
        let mut rec = record();
        let original = rec.clone();
        assert!(failing_mutation(&mut rec).is_err());
        assert_eq!(rec, original);
    }

    #[test]
    fn commit_keeps_mutation() {
        let mut rec = record();
        let mut guard = MutationGuard::begin(&mut rec);
        guard.meta.generation = 6;
        guard.remove_bin("a");
        let old = guard.commit();
        assert_eq!(old.len(), 1);
        assert_eq!(rec.meta.generation, 6);
        assert!(rec.is_empty());
    }
}
