//! Clock sources and last-update-time (LUT) conversions.
//!
//! Record timestamps are milliseconds since the citrusleaf epoch
//! (2010-01-01T00:00:00Z). On the wire a LUT occupies 40 bits; void times
//! are whole seconds since the same epoch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Citrusleaf epoch expressed in unix seconds.
pub const CITRUSLEAF_EPOCH_SECS: u64 = 1_262_304_000;

/// Citrusleaf epoch expressed in unix milliseconds.
pub const CITRUSLEAF_EPOCH_MS: u64 = CITRUSLEAF_EPOCH_SECS * 1000;

/// Number of bits a LUT occupies on the wire.
pub const LUT_BITS: u32 = 40;

/// Largest representable LUT.
pub const MAX_LUT: u64 = (1 << LUT_BITS) - 1;

/// Convert unix-epoch nanoseconds into a citrusleaf-epoch LUT.
///
/// Returns `None` when the instant precedes the citrusleaf epoch or does
/// not fit in 40 bits.
pub fn lut_from_unix_ns(unix_ns: u64) -> Option<u64> {
    let unix_ms = unix_ns / 1_000_000;
    let lut = unix_ms.checked_sub(CITRUSLEAF_EPOCH_MS)?;
    (lut > 0 && lut <= MAX_LUT).then_some(lut)
}

/// Convert a LUT back into unix-epoch nanoseconds.
pub fn unix_ns_from_lut(lut: u64) -> u64 {
    (lut + CITRUSLEAF_EPOCH_MS) * 1_000_000
}

/// Source of the current time in citrusleaf-epoch milliseconds.
///
/// Injected everywhere a LUT or deadline is computed so tests can drive
/// time explicitly.
pub trait Clock: Send + Sync {
    /// Milliseconds since the citrusleaf epoch.
    fn now_ms(&self) -> u64;

    /// Whole seconds since the citrusleaf epoch (void-time resolution).
    fn now_secs(&self) -> u32 {
        u32::try_from(self.now_ms() / 1000).unwrap_or(u32::MAX)
    }
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        unix_ms.saturating_sub(CITRUSLEAF_EPOCH_MS)
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Jump to an absolute time.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }
}
