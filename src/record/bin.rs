//! Bins: named value slots within a record.
//!
//! With bin convergence enabled every bin carries its own LUT, and a
//! deleted bin stays behind as a tombstone (`particle == None`) so the
//! deletion itself can be replicated and reconciled.

use serde::{Deserialize, Serialize};

/// Longest bin name accepted.
pub const MAX_BIN_NAME_LEN: usize = 15;

/// A typed bin value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Particle {
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
}

impl Particle {
    fn type_tag(&self) -> u8 {
        match self {
            Self::Integer(_) => 1,
            Self::Float(_) => 2,
            Self::String(_) => 3,
            Self::Blob(_) => 4,
        }
    }

    /// Total order over values, used only to break exact LUT ties
    /// identically on every node.
    pub fn deterministic_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.type_tag()
            .cmp(&other.type_tag())
            .then_with(|| match (self, other) {
                (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
                (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
                (Self::String(a), Self::String(b)) => a.as_bytes().cmp(b.as_bytes()),
                (Self::Blob(a), Self::Blob(b)) => a.cmp(b),
                _ => std::cmp::Ordering::Equal,
            })
    }
}

/// A named value slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    /// Bin name.
    pub name: String,
    /// Value, or `None` for a tombstoned bin.
    pub particle: Option<Particle>,
    /// LUT of the write that last touched this bin (0 without bin metadata).
    pub lut: u64,
}

impl Bin {
    /// Live bin.
    pub fn new(name: impl Into<String>, particle: Particle, lut: u64) -> Self {
        Self {
            name: name.into(),
            particle: Some(particle),
            lut,
        }
    }

    /// Tombstoned bin.
    pub fn tombstone(name: impl Into<String>, lut: u64) -> Self {
        Self {
            name: name.into(),
            particle: None,
            lut,
        }
    }

    /// Whether this bin records a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.particle.is_none()
    }

    /// Ordering between two versions of the same bin. `Greater` means
    /// `self` survives.
    pub fn version_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.lut.cmp(&other.lut).then_with(|| match (&self.particle, &other.particle) {
            (Some(a), Some(b)) => a.deterministic_cmp(b),
            // A deletion at the same instant beats a value.
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, None) => std::cmp::Ordering::Equal,
        })
    }
}

/// Validate a bin name.
pub fn is_valid_bin_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_BIN_NAME_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn newer_lut_wins() {
        let old = Bin::new("a", Particle::Integer(9), 10);
        let new = Bin::new("a", Particle::Integer(1), 11);
        assert_eq!(new.version_cmp(&old), Ordering::Greater);
    }

    #[test]
    fn tie_is_deterministic() {
        let x = Bin::new("a", Particle::String("x".into()), 10);
        let y = Bin::new("a", Particle::String("y".into()), 10);
        assert_eq!(y.version_cmp(&x), Ordering::Greater);
        assert_eq!(x.version_cmp(&y), Ordering::Less);
        let gone = Bin::tombstone("a", 10);
        assert_eq!(gone.version_cmp(&y), Ordering::Greater);
    }

    #[test]
    fn bin_name_bounds() {
        assert!(is_valid_bin_name("a"));
        assert!(!is_valid_bin_name(""));
        assert!(!is_valid_bin_name("abcdefghijklmnop"));
    }
}
