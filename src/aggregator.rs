//! # Vehicle Sample Aggregation
//!
//! The only state shared between threads in the core: the running min/max/average of
//! vehicle samples since the last correlated emission, plus the latest single sample.
//! Both sit behind one mutex. Writers get [`Aggregator::record`] and
//! [`Aggregator::record_no_data`], the correlator gets [`Aggregator::snapshot_and_reset`];
//! the guarded fields are never exposed.
//!
//! ## Bounded Waits
//!
//! Every acquisition uses `try_lock_for`. On timeout the operation is abandoned, counted
//! and logged. A lost update is accepted imprecision; a stalled sampler is not.
//!
//! ## Incremental Statistics
//! ```text
//! first sample:  min = max = avg = v
//! n-th sample:   min = min(min, v), max = max(max, v), avg += (v - avg) / n
//! ```

use crate::VehicleSample;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Default bound on waiting for the shared state.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Running statistics over the samples seen since the last reset.
///
/// An empty window (`count == 0`) is distinct from a one-sample window: the accessors
/// return `None` rather than a zero that could be mistaken for a reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AggregateWindow {
    count: u32,
    min: f32,
    max: f32,
    average: f32,
}

impl AggregateWindow {
    pub const EMPTY: AggregateWindow = AggregateWindow {
        count: 0,
        min: 0.0,
        max: 0.0,
        average: 0.0,
    };

    pub fn record(&mut self, value: f32) {
        self.count = self.count.saturating_add(1);
        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.average = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
            self.average += (value - self.average) / self.count as f32;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn min(&self) -> Option<f32> {
        (!self.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<f32> {
        (!self.is_empty()).then_some(self.max)
    }

    pub fn average(&self) -> Option<f32> {
        (!self.is_empty()).then_some(self.average)
    }
}

/// What the correlator takes at fix-emission time.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AggregateSnapshot {
    pub window: AggregateWindow,
    /// Last decoded sample, `None` if nothing arrived yet or the last poll had no data
    pub latest: Option<VehicleSample>,
}

#[derive(Default)]
struct SharedState {
    window: AggregateWindow,
    latest: Option<VehicleSample>,
}

pub struct Aggregator {
    shared: Mutex<SharedState>,
    lock_timeout: Duration,
    dropped_updates: AtomicU64,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl Aggregator {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            shared: Mutex::new(SharedState::default()),
            lock_timeout,
            dropped_updates: AtomicU64::new(0),
        }
    }

    /// Fold a sample into the window and make it the latest value.
    ///
    /// Returns `false` if the lock could not be taken in time and the sample was lost.
    pub fn record(&self, sample: VehicleSample) -> bool {
        let Some(mut shared) = self.shared.try_lock_for(self.lock_timeout) else {
            self.lock_timeout_hit("record");
            return false;
        };
        shared.window.record(sample.value);
        shared.latest = Some(sample);
        true
    }

    /// Mark the latest value as unknown after a poll that got no answer.
    ///
    /// The window is left alone; "no data" is not a sample.
    pub fn record_no_data(&self) -> bool {
        let Some(mut shared) = self.shared.try_lock_for(self.lock_timeout) else {
            self.lock_timeout_hit("record_no_data");
            return false;
        };
        shared.latest = None;
        true
    }

    /// Take the current window and reset it to empty, as one step.
    ///
    /// The latest sample is returned but kept. Returns `None` on lock timeout, in which
    /// case nothing was reset.
    pub fn snapshot_and_reset(&self) -> Option<AggregateSnapshot> {
        let Some(mut shared) = self.shared.try_lock_for(self.lock_timeout) else {
            self.lock_timeout_hit("snapshot_and_reset");
            return None;
        };
        let window = std::mem::take(&mut shared.window);
        Some(AggregateSnapshot {
            window,
            latest: shared.latest,
        })
    }

    /// Peek at the latest sample without touching the window.
    pub fn latest(&self) -> Option<VehicleSample> {
        match self.shared.try_lock_for(self.lock_timeout) {
            Some(shared) => shared.latest,
            None => {
                self.lock_timeout_hit("latest");
                None
            }
        }
    }

    /// Operations abandoned because the lock stayed busy past the timeout.
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }

    /// Run `f` while the shared state is held, so other callers time out.
    #[cfg(test)]
    pub(crate) fn while_locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.shared.lock();
        f()
    }

    fn lock_timeout_hit(&self, operation: &'static str) {
        self.dropped_updates.fetch_add(1, Ordering::Relaxed);
        warn!(
            operation,
            timeout_ms = self.lock_timeout.as_millis() as u64,
            "shared vehicle state busy, skipping"
        );
    }
}
