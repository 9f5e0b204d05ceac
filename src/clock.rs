//! Uptime sources.
//!
//! Every timestamp in the core is milliseconds of uptime, like a firmware tick counter.
//! The gate in [`crate::fix_filter`] and the record stamps in [`crate::correlator`]
//! read time through [`Clock`] so tests and replays can drive it by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic uptime in milliseconds.
pub trait Clock: Send + Sync {
    fn uptime_ms(&self) -> u64;
}

/// Wall-clock backed uptime, counted from construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn uptime_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven uptime for deterministic replays and tests.
///
/// # Example
/// ```
/// use asset_tracker_lib::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(0);
/// clock.advance_ms(1_500);
/// assert_eq!(clock.uptime_ms(), 1_500);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, delta_s: u64) {
        self.advance_ms(delta_s * 1000);
    }
}

impl Clock for ManualClock {
    fn uptime_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
