//! Namespace and set truncation.
//!
//! A truncate command raises a last-update-time threshold for a namespace
//! or one of its sets. Records at or below the threshold are logically
//! deleted at once and physically removed by a background reaping pass.
//!
//! - [`registry`] - per-namespace thresholds, the pass state machine and
//!   point queries used by the write path
//! - [`reaper`] - the bounded worker pool that scans partitions
//! - [`log`] - the persisted threshold log replayed at startup

pub mod log;
pub mod reaper;
pub mod registry;

pub use log::{TruncateHval, TruncateLog, TruncateLogEntry};
pub use registry::{Cenotaph, TruncatePhase, TruncateStats, TruncationRegistry};

/// Process-wide ceiling on concurrently running reaper threads.
pub const MAX_TRUNCATE_THREADS: u32 = 128;

/// Longest set name a truncate command accepts.
pub const MAX_SET_NAME_LEN: usize = 63;
