//! # Clock
//!
//! Monotonic time source injected into the device. The migration throttle and
//! every bounded wait read time through this trait, so hosts without `std`
//! can plug in a hardware counter and tests can drive time by hand.

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic nanosecond clock
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary fixed origin
    fn now_ns(&self) -> u64;

    /// Microseconds since the same origin
    fn now_us(&self) -> u64 {
        self.now_ns() / 1_000
    }
}

// =============================================================================
// MANUAL CLOCK
// =============================================================================

/// Clock advanced explicitly by its owner
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start_ns`
    pub const fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    /// Move time forward
    pub fn advance_ns(&self, delta: u64) {
        self.now_ns.fetch_add(delta, Ordering::AcqRel);
    }

    /// Move time forward by microseconds
    pub fn advance_us(&self, delta: u64) {
        self.advance_ns(delta.saturating_mul(1_000));
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

// =============================================================================
// MONOTONIC CLOCK
// =============================================================================

/// Host monotonic clock
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl MonotonicClock {
    /// Create a clock whose origin is now
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}
