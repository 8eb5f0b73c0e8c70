//! Write-path coordination.
//!
//! - [`registry`] - single-flight map of in-flight transactions
//! - [`request`] - per-key transaction state and its event methods
//! - [`dup_res`] - duplicate resolution
//! - [`repl_write`] - replica writes, confirmation and ping
//! - [`policy`] - merge, validation and unwind rules
//! - [`coordinator`] - drives transactions and dispatches peer messages

pub mod coordinator;
pub mod dup_res;
pub mod policy;
pub mod registry;
pub mod repl_write;
pub mod request;

pub use coordinator::{Admission, Coordinator, CoordinatorDeps};
pub use registry::{InsertOutcome, RwRequestRegistry};
pub use request::{RequestId, RwRequest};

use crate::core::config::CommitLevel;
use crate::core::error::ResultCode;
use crate::record::{Digest, Particle};

/// Client expectation on the record's current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GenerationPolicy {
    /// No check.
    #[default]
    None,
    /// Current generation must equal the value.
    Eq(u16),
    /// The value must exceed the current generation.
    Gt(u16),
}

impl GenerationPolicy {
    pub fn expected(&self) -> Option<u16> {
        match *self {
            Self::None => None,
            Self::Eq(g) | Self::Gt(g) => Some(g),
        }
    }
}

/// Origin of a write's bin operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteSource {
    #[default]
    Client,
    Udf,
}

/// One bin operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BinOp {
    Write { name: String, particle: Particle },
    Delete { name: String },
}

impl BinOp {
    pub fn name(&self) -> &str {
        match self {
            Self::Write { name, .. } | Self::Delete { name } => name,
        }
    }
}

/// A client write as admitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub namespace: String,
    pub set_name: Option<String>,
    pub digest: Digest,
    pub ops: Vec<BinOp>,
    pub generation: GenerationPolicy,
    /// Requested TTL in seconds, or one of the sentinels in [`policy`].
    pub ttl: u32,
    /// Overrides the namespace commit level.
    pub commit_level: Option<CommitLevel>,
    /// Delete the whole record.
    pub delete: bool,
    /// Keep a tombstone instead of dropping the record.
    pub durable_delete: bool,
    pub source: WriteSource,
}

impl WriteRequest {
    /// Write with no operations.
    pub fn new(namespace: impl Into<String>, digest: Digest) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: None,
            digest,
            ops: Vec::new(),
            generation: GenerationPolicy::None,
            ttl: policy::TTL_NAMESPACE_DEFAULT,
            commit_level: None,
            delete: false,
            durable_delete: false,
            source: WriteSource::Client,
        }
    }

    pub fn with_set(mut self, set_name: impl Into<String>) -> Self {
        self.set_name = Some(set_name.into());
        self
    }

    pub fn put(mut self, name: impl Into<String>, particle: Particle) -> Self {
        self.ops.push(BinOp::Write {
            name: name.into(),
            particle,
        });
        self
    }

    pub fn remove_bin(mut self, name: impl Into<String>) -> Self {
        self.ops.push(BinOp::Delete { name: name.into() });
        self
    }

    pub fn expect_generation(mut self, generation: u16) -> Self {
        self.generation = GenerationPolicy::Eq(generation);
        self
    }

    pub fn with_generation_policy(mut self, generation: GenerationPolicy) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_commit_level(mut self, level: CommitLevel) -> Self {
        self.commit_level = Some(level);
        self
    }

    /// Turn this into a record delete.
    pub fn delete_record(mut self, durable: bool) -> Self {
        self.delete = true;
        self.durable_delete = durable;
        self
    }

    pub fn from_udf(mut self) -> Self {
        self.source = WriteSource::Udf;
        self
    }
}

/// Terminal answer delivered to the transaction's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResponse {
    pub result: ResultCode,
    pub generation: u16,
    pub last_update_time: u64,
    pub void_time: u32,
}

impl WriteResponse {
    /// Result code with no record metadata.
    pub fn bare(result: ResultCode) -> Self {
        Self {
            result,
            generation: 0,
            last_update_time: 0,
            void_time: 0,
        }
    }
}
