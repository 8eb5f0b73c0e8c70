//! Record digests and the composite request key.

use serde::{Deserialize, Serialize};

/// Digest width in bytes (160 bits).
pub const DIGEST_SIZE: usize = 20;

/// Partitions per namespace. A digest's low 12 bits pick its partition.
pub const N_PARTITIONS: u32 = 4096;

/// Fixed-width hash identifying a record's key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    /// Build a digest from exactly [`DIGEST_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DIGEST_SIZE] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Parse a 40-character hex string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != DIGEST_SIZE * 2 {
            return None;
        }
        let mut out = [0u8; DIGEST_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Self(out))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Partition this digest belongs to.
    pub fn partition_id(&self) -> u32 {
        u32::from(u16::from_le_bytes([self.0[0], self.0[1]])) & (N_PARTITIONS - 1)
    }

    /// Index used to pick a lock shard.
    ///
    /// Reads bytes disjoint from the partition bits so keys of one
    /// partition still spread across shards.
    pub fn shard_bits(&self) -> u32 {
        u32::from_le_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// Composite key under which an in-flight transaction is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    /// Index of the namespace in the node configuration.
    pub ns_index: u32,
    /// Record digest.
    pub digest: Digest,
}

impl RequestKey {
    /// Packed width: 4-byte namespace index followed by the digest.
    pub const PACKED_SIZE: usize = 4 + DIGEST_SIZE;

    /// Create a request key.
    pub const fn new(ns_index: u32, digest: Digest) -> Self {
        Self { ns_index, digest }
    }

    /// Pack with no padding, namespace index little-endian.
    pub fn to_bytes(&self) -> [u8; Self::PACKED_SIZE] {
        let mut out = [0u8; Self::PACKED_SIZE];
        out[..4].copy_from_slice(&self.ns_index.to_le_bytes());
        out[4..].copy_from_slice(&self.digest.0);
        out
    }

    /// Unpack from exactly [`Self::PACKED_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::PACKED_SIZE {
            return None;
        }
        let ns_index = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let digest = Digest::from_slice(&bytes[4..])?;
        Some(Self { ns_index, digest })
    }

    /// Partition of the keyed record.
    pub fn partition_id(&self) -> u32 {
        self.digest.partition_id()
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ns_index, self.digest)
    }
}
