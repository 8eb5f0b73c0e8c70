//! Keystone - write-path coordination core for a clustered key-value node.
//!
//! Keystone tracks in-flight client write transactions, resolves divergent
//! record copies across replicas, replicates each accepted write to the
//! partition's replicas, and applies namespace/set truncation with
//! background reaping. Storage, partition ownership, secondary indexes and
//! peer transport are collaborators reached through the traits in
//! [`cluster`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Client writes / peer messages                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Coordinator                              │
//! │   single-flight registry │ dup-res │ replica writes │ ping      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Truncation registry                         │
//! │        thresholds │ startup replay │ reaper pool │ log          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  RecordStore │ PartitionMap │ Transport │ SindexObserver        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Main runtime orchestration
//! - [`core::time`] - Citrusleaf-epoch clocks
//! - [`core::error`] - Error types and result codes
//!
//! ## Write path
//! - [`rw::registry`] - Single-flight map of in-flight transactions
//! - [`rw::request`] - Per-key transaction state machine
//! - [`rw::dup_res`] - Duplicate resolution
//! - [`rw::repl_write`] - Replica writes, confirmation and ping
//! - [`rw::policy`] - Merge, validation and unwind rules
//! - [`rw::coordinator`] - Transaction driver and message dispatch
//!
//! ## Truncation
//! - [`truncate::registry`] - Thresholds and pass state machine
//! - [`truncate::reaper`] - Bounded reaper pool
//! - [`truncate::log`] - Persisted threshold log
//!
//! ## Model and wire
//! - [`record`] - Digests, keys, metadata and bins
//! - [`wire`] - Peer message codec
//! - [`cluster`] - Collaborator traits and in-memory implementations
//!
//! ## Operations
//! - [`ops::observability`] - Metrics and health checks
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - At most one in-flight transaction per (namespace, digest)
//! - A truncation threshold never decreases
//! - A record whose LUT is at or below its threshold is never visible
//! - A failed local write leaves the record exactly as it was

// Core infrastructure
pub mod core;

// Record model
pub mod record;

// Wire codec
pub mod wire;

// Collaborator interfaces
pub mod cluster;

// Write path
pub mod rw;

// Truncation
pub mod truncate;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use ops::observability;
pub use rw::{Admission, Coordinator, CoordinatorDeps, WriteRequest, WriteResponse};
pub use truncate::TruncationRegistry;
