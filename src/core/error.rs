//! Error types and result-code mapping.
//!
//! Every transaction ends with exactly one terminal [`ResultCode`]. Internal
//! failures are carried as [`KeystoneError`] and classified into the four
//! families the coordinator reasons about: transient, conflict, validation
//! and fatal/local.

use crate::cluster::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result codes exchanged with clients and peer nodes.
///
/// The numeric values go on the wire. Never renumber; only append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,
    Unknown = 1,
    NotFound = 2,
    Generation = 3,
    Parameter = 4,
    RecordExists = 5,
    ClusterKeyMismatch = 7,
    Timeout = 9,
    Unavailable = 11,
    KeyBusy = 14,
    DeviceOverload = 18,
    Namespace = 20,
    Forbidden = 22,
    LostConflict = 28,
}

impl ResultCode {
    /// Numeric wire value.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Whether this code reports success.
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl TryFrom<u32> for ResultCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::Unknown,
            2 => Self::NotFound,
            3 => Self::Generation,
            4 => Self::Parameter,
            5 => Self::RecordExists,
            7 => Self::ClusterKeyMismatch,
            9 => Self::Timeout,
            11 => Self::Unavailable,
            14 => Self::KeyBusy,
            18 => Self::DeviceOverload,
            20 => Self::Namespace,
            22 => Self::Forbidden,
            28 => Self::LostConflict,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_u32())
    }
}

/// Error families used for retry and surfacing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Node busy, timeout, stale partition view. Retried with backoff.
    Transient,
    /// Generation or set mismatch, concurrent supersede. Surfaced, not retried.
    Conflict,
    /// Rejected before any state is created.
    Validation,
    /// Local failure. The mutation is unwound.
    Fatal,
}

/// Keystone error conditions.
#[derive(Debug, Error)]
pub enum KeystoneError {
    /// Request names a namespace this node does not serve.
    #[error("namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    /// Peer message references a namespace index this node does not serve.
    #[error("namespace index {ns_index} out of range")]
    NamespaceIndex { ns_index: u32 },

    /// TTL is neither within bounds nor a sentinel.
    #[error("invalid ttl {ttl}")]
    InvalidTtl { ttl: u32 },

    /// Positive TTL on a namespace that cannot enforce expiration.
    #[error("ttl {ttl} disallowed: namespace {namespace} has no expiration sweep")]
    TtlDisallowed { ttl: u32, namespace: String },

    /// Compare-and-set on generation failed.
    #[error("generation mismatch: record at {current}, request expected {expected}")]
    GenerationMismatch { current: u16, expected: u16 },

    /// Delete targets a record that does not exist.
    #[error("record not found")]
    RecordNotFound,

    /// Record already belongs to a different set.
    #[error("set name mismatch: record in {record_set:?}, request names {request_set:?}")]
    SetMismatch {
        record_set: Option<String>,
        request_set: String,
    },

    /// Malformed request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Write would be truncated on arrival or targets a truncated version.
    #[error("write forbidden: {reason}")]
    Forbidden { reason: String },

    /// Too few reachable replicas for the namespace durability policy.
    #[error("insufficient replica destinations: {available} available, {required} required")]
    InsufficientReplicas { available: usize, required: usize },

    /// This node does not own the partition.
    #[error("not master for partition {partition_id}")]
    NotMaster { partition_id: u32 },

    /// A replica holds a newer version than the one being written.
    #[error("lost conflict against a newer copy")]
    LostConflict,

    /// Sender and receiver disagree on the partition regime.
    #[error("cluster key mismatch: expected regime {expected}, observed {observed}")]
    RegimeMismatch { expected: u32, observed: u32 },

    /// Replicas did not answer within the retry budget.
    #[error("transaction timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// Storage collaborator failure.
    #[error("storage failure: {message}")]
    Storage { message: String },

    /// Transport collaborator failure.
    #[error("transport failure to node {node}: {message}")]
    Transport { node: NodeId, message: String },

    /// Peer message could not be decoded.
    #[error("wire decode failed: {message}")]
    Wire { message: String },

    /// Admin truncate command rejected.
    #[error("truncate rejected: {message}")]
    TruncateRejected { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl KeystoneError {
    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a Forbidden error.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    /// Create a Storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a Wire error.
    pub fn wire(message: impl Into<String>) -> Self {
        Self::Wire {
            message: message.into(),
        }
    }

    /// Create a TruncateRejected error.
    pub fn truncate_rejected(message: impl Into<String>) -> Self {
        Self::TruncateRejected {
            message: message.into(),
        }
    }

    /// Error family of this condition.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } | Self::RegimeMismatch { .. } | Self::Transport { .. } => {
                ErrorClass::Transient
            }
            Self::GenerationMismatch { .. } | Self::SetMismatch { .. } | Self::LostConflict => {
                ErrorClass::Conflict
            }
            Self::NamespaceNotFound { .. }
            | Self::NamespaceIndex { .. }
            | Self::InvalidTtl { .. }
            | Self::TtlDisallowed { .. }
            | Self::InvalidRequest { .. }
            | Self::RecordNotFound
            | Self::Forbidden { .. }
            | Self::InsufficientReplicas { .. }
            | Self::NotMaster { .. }
            | Self::TruncateRejected { .. } => ErrorClass::Validation,
            Self::Storage { .. } | Self::Wire { .. } | Self::Internal { .. } => ErrorClass::Fatal,
        }
    }

    /// Check if this error indicates the operation should be retried.
    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Terminal result code reported for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::NamespaceNotFound { .. } | Self::NamespaceIndex { .. } => ResultCode::Namespace,
            Self::InvalidTtl { .. }
            | Self::InvalidRequest { .. }
            | Self::SetMismatch { .. }
            | Self::TruncateRejected { .. } => ResultCode::Parameter,
            Self::TtlDisallowed { .. } | Self::Forbidden { .. } => ResultCode::Forbidden,
            Self::GenerationMismatch { .. } => ResultCode::Generation,
            Self::RecordNotFound => ResultCode::NotFound,
            Self::InsufficientReplicas { .. } | Self::NotMaster { .. } => ResultCode::Unavailable,
            Self::LostConflict => ResultCode::LostConflict,
            Self::RegimeMismatch { .. } => ResultCode::ClusterKeyMismatch,
            Self::Timeout { .. } | Self::Transport { .. } => ResultCode::Timeout,
            Self::Storage { .. } | Self::Wire { .. } | Self::Internal { .. } => {
                ResultCode::Unknown
            }
        }
    }
}

/// Result type using KeystoneError.
pub type KeystoneResult<T> = Result<T, KeystoneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_round_trips_known_values() {
        for code in [
            ResultCode::Ok,
            ResultCode::Generation,
            ResultCode::ClusterKeyMismatch,
            ResultCode::LostConflict,
        ] {
            assert_eq!(ResultCode::try_from(code.as_u32()), Ok(code));
        }
        assert_eq!(ResultCode::try_from(6), Err(6));
    }

    #[test]
    fn error_classes() {
        assert!(KeystoneError::Timeout { attempts: 3 }.is_retriable());
        assert_eq!(
            KeystoneError::GenerationMismatch {
                current: 5,
                expected: 4
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            KeystoneError::InvalidTtl { ttl: 7 }.result_code(),
            ResultCode::Parameter
        );
        assert_eq!(
            KeystoneError::storage("disk").class(),
            ErrorClass::Fatal
        );
    }
}
