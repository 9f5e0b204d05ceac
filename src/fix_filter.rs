//! # Fix Filter
//!
//! Turns assembled sentences into [`FixEvent`]s. Runs synchronously on the serial
//! receive path, so every step is bounded-time and the final enqueue is a `try_send`.
//!
//! ## Decision Order
//! 1. Non-RMC sentences are ignored (not an error)
//! 2. RMC sentences that fail to parse are dropped and logged
//! 3. The minimum-interval gate drops anything arriving before the interval has elapsed
//!    since the last emission
//! 4. A locked fix is emitted; an unlocked fix is replaced by a synthetic one when enabled
//! 5. Emission resets the gate, even when the queue turns out to be full
//!
//! An unlocked fix with synthetic mode disabled emits nothing and leaves the gate alone,
//! so the next attempt is measured from the original window edge.

use crate::assembler::SentenceHandler;
use crate::clock::Clock;
use crate::fallback::synthetic_fix;
use crate::nmea::{self, SentenceId};
use crate::settings::Settings;
use crate::{FixEvent, FixSource};
use crossbeam_channel::{Sender, TrySendError};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Not an RMC sentence
    Ignored,
    /// RMC sentence that failed to parse (or was not UTF-8)
    Malformed,
    /// Dropped by the minimum-interval gate
    Throttled,
    /// Enqueued as a FixEvent
    Emitted(FixSource),
    /// No satellite lock and synthetic fixes disabled
    NoLock,
    /// Passed the gate but the event queue was full; the event was dropped
    QueueFull(FixSource),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    pub emitted: u64,
    pub throttled: u64,
    pub malformed: u64,
    pub no_lock: u64,
    pub dropped: u64,
}

pub struct FixFilter {
    settings: Arc<Settings>,
    clock: Arc<dyn Clock>,
    events: Sender<FixEvent>,
    /// Uptime of the last accepted emission; `None` until the first one
    last_emit_ms: Option<u64>,
    stats: FilterStats,
}

impl FixFilter {
    pub fn new(settings: Arc<Settings>, clock: Arc<dyn Clock>, events: Sender<FixEvent>) -> Self {
        Self {
            settings,
            clock,
            events,
            last_emit_ms: None,
            stats: FilterStats::default(),
        }
    }

    /// Run one sentence through the filter.
    pub fn process(&mut self, sentence: &str) -> FilterOutcome {
        if nmea::sentence_id(sentence) != SentenceId::Rmc {
            return FilterOutcome::Ignored;
        }

        let observed = match nmea::parse_rmc(sentence) {
            Ok(fix) => fix,
            Err(e) => {
                debug!(error = %e, "dropping malformed RMC sentence");
                self.stats.malformed += 1;
                return FilterOutcome::Malformed;
            }
        };

        let now = self.clock.uptime_ms();
        if !self.gate_open(now) {
            self.stats.throttled += 1;
            return FilterOutcome::Throttled;
        }

        let fix = if observed.valid {
            observed
        } else {
            match synthetic_fix(&observed, &self.settings) {
                Some(fix) => fix,
                None => {
                    debug!("no satellite lock, synthetic fixes disabled");
                    self.stats.no_lock += 1;
                    return FilterOutcome::NoLock;
                }
            }
        };

        self.last_emit_ms = Some(now);
        let event = FixEvent {
            fix,
            arrival_ms: now,
        };
        match self.events.try_send(event) {
            Ok(()) => {
                self.stats.emitted += 1;
                FilterOutcome::Emitted(fix.source)
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                warn!("fix queue full, dropping newest fix");
                self.stats.dropped += 1;
                FilterOutcome::QueueFull(fix.source)
            }
        }
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    pub fn last_emit_ms(&self) -> Option<u64> {
        self.last_emit_ms
    }

    fn gate_open(&self, now_ms: u64) -> bool {
        let interval_ms = self.settings.fix_interval_s() as u64 * 1000;
        match self.last_emit_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= interval_ms,
        }
    }
}

impl SentenceHandler for FixFilter {
    fn on_sentence(&mut self, sentence: &[u8]) {
        match std::str::from_utf8(sentence) {
            Ok(text) => {
                self.process(text);
            }
            Err(_) => {
                debug!(len = sentence.len(), "dropping non-UTF-8 sentence");
                self.stats.malformed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::settings::{keys, SettingValue};
    use crossbeam_channel::Receiver;

    const LOCKED: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
    const UNLOCKED: &str = "$GPRMC,123520,V,,,,,,,230394,,,N";

    fn setup(
        interval_s: i64,
        capacity: usize,
    ) -> (FixFilter, Arc<ManualClock>, Arc<Settings>, Receiver<FixEvent>) {
        let settings = Arc::new(Settings::default());
        settings.set(keys::FIX_INTERVAL_S, SettingValue::Int(interval_s));
        let clock = Arc::new(ManualClock::new(1_000));
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let filter = FixFilter::new(settings.clone(), clock.clone(), tx);
        (filter, clock, settings, rx)
    }

    #[test]
    fn test_first_fix_passes_and_gate_throttles() {
        let (mut filter, clock, _settings, rx) = setup(5, 4);

        assert_eq!(
            filter.process(LOCKED),
            FilterOutcome::Emitted(FixSource::Satellite)
        );
        clock.advance_ms(4_999);
        assert_eq!(filter.process(LOCKED), FilterOutcome::Throttled);
        clock.advance_ms(1);
        assert_eq!(
            filter.process(LOCKED),
            FilterOutcome::Emitted(FixSource::Satellite)
        );

        let arrivals: Vec<u64> = rx.try_iter().map(|e| e.arrival_ms).collect();
        assert_eq!(arrivals, vec![1_000, 6_000]);
    }

    #[test]
    fn test_other_sentences_are_ignored() {
        let (mut filter, _clock, _settings, rx) = setup(0, 4);
        assert_eq!(
            filter.process("$GPGSV,3,1,11,03,03,111,00,04,15,270,00,06,01,010,00,13,06,292,00*74"),
            FilterOutcome::Ignored
        );
        assert_eq!(filter.process("noise"), FilterOutcome::Ignored);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_rmc_does_not_touch_gate() {
        let (mut filter, _clock, _settings, _rx) = setup(5, 4);
        assert_eq!(
            filter.process("$GPRMC,123519,A,4807.038,N*00"),
            FilterOutcome::Malformed
        );
        assert_eq!(filter.last_emit_ms(), None);
        assert_eq!(filter.stats().malformed, 1);
    }

    #[test]
    fn test_no_lock_without_synthetic_keeps_window_edge() {
        let (mut filter, clock, _settings, rx) = setup(5, 4);

        filter.process(LOCKED);
        clock.advance_secs(5);
        assert_eq!(filter.process(UNLOCKED), FilterOutcome::NoLock);
        assert_eq!(filter.last_emit_ms(), Some(1_000));

        // Still measured from the first emission, so an immediate retry passes.
        clock.advance_ms(10);
        assert_eq!(
            filter.process(LOCKED),
            FilterOutcome::Emitted(FixSource::Satellite)
        );
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_no_lock_with_synthetic_emits_substitute_and_resets_gate() {
        let (mut filter, clock, settings, rx) = setup(5, 4);
        settings.set(keys::SYNTHETIC_ENABLED, SettingValue::Bool(true));

        assert_eq!(
            filter.process(UNLOCKED),
            FilterOutcome::Emitted(FixSource::Synthetic)
        );
        clock.advance_ms(100);
        assert_eq!(filter.process(LOCKED), FilterOutcome::Throttled);

        let event = rx.try_recv().unwrap();
        assert!(event.fix.valid);
        assert!(event.fix.is_synthetic());
        assert!((event.fix.latitude.to_degrees() - 37.789_98).abs() < 1e-5);
    }

    #[test]
    fn test_full_queue_drops_newest_and_still_resets_gate() {
        let (mut filter, clock, _settings, rx) = setup(0, 1);

        assert_eq!(
            filter.process(LOCKED),
            FilterOutcome::Emitted(FixSource::Satellite)
        );
        clock.advance_ms(1);
        assert_eq!(
            filter.process(LOCKED),
            FilterOutcome::QueueFull(FixSource::Satellite)
        );
        assert_eq!(filter.last_emit_ms(), Some(1_001));
        assert_eq!(filter.stats().dropped, 1);

        // The queued event is the first one.
        assert_eq!(rx.try_recv().unwrap().arrival_ms, 1_000);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_interval_change_applies_to_next_sentence() {
        let (mut filter, clock, settings, _rx) = setup(60, 4);

        filter.process(LOCKED);
        clock.advance_secs(10);
        assert_eq!(filter.process(LOCKED), FilterOutcome::Throttled);

        settings.set(keys::FIX_INTERVAL_S, SettingValue::Int(10));
        assert_eq!(
            filter.process(LOCKED),
            FilterOutcome::Emitted(FixSource::Satellite)
        );
    }

    #[test]
    fn test_handler_rejects_invalid_utf8() {
        let (mut filter, _clock, _settings, _rx) = setup(0, 4);
        filter.on_sentence(&[b'$', 0xFF, 0xFE]);
        assert_eq!(filter.stats().malformed, 1);
    }
}
