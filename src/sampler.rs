//! # Vehicle Speed Sampling
//!
//! Two ways to learn the vehicle speed from CAN, selected at configuration time:
//!
//! ## Passive
//! Listen for a broadcast frame some ECU already sends. Every matching frame of the
//! expected length is decoded and recorded; nothing is transmitted.
//! ```text
//! ID 0x244 (extended), DLC 5:  [_, _, _, speed_hi, speed_lo]   speed = be16 / 100 km/h
//! ```
//!
//! ## Active (OBD2 PID 0x0D)
//! Every sample interval, send a functional request and collect responses for a bounded
//! window. The last matching response in the window wins. No answer records "no data".
//! ```text
//! request  0x7DF: [0x02, 0x01, 0x0D, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
//! response 0x7E8: [len, 0x41, 0x0D, speed_kmh, ...]   DLC 8 or 4
//! ```
//!
//! Length mismatches are logged and skipped. Decoded speeds are converted to the
//! configured unit before they reach the [`Aggregator`].

use crate::aggregator::Aggregator;
use crate::can::{CanBus, CanError, CanFilter, CanFrame};
use crate::clock::Clock;
use crate::config::CanConfig;
use crate::settings::{SettingKey, Settings};
use crate::VehicleSample;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub const OBD_REQUEST_ID: u32 = 0x7DF;
pub const OBD_RESPONSE_ID: u32 = 0x7E8;
pub const OBD_SERVICE_CURRENT_DATA: u8 = 0x01;
/// Positive response to service 0x01
pub const OBD_CURRENT_DATA_RESPONSE: u8 = OBD_SERVICE_CURRENT_DATA + 0x40;
pub const OBD_PID_VEHICLE_SPEED: u8 = 0x0D;
/// Unused request bytes
pub const OBD_PADDING: u8 = 0xCC;
/// Accepted response lengths
pub const OBD_RESPONSE_LENGTHS: [usize; 2] = [8, 4];

pub const BROADCAST_SPEED_ID: u32 = 0x244;
pub const BROADCAST_SPEED_LENGTH: usize = 5;

pub const KMH_TO_MPH: f32 = 0.621_375_1;

/// Longest a worker sleeps before re-checking the stop flag.
const STOP_CHECK: Duration = Duration::from_millis(100);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("wrong CAN frame data length {actual}, expected one of {expected:?}")]
    Length {
        expected: &'static [usize],
        actual: usize,
    },
}

/// How the sampler obtains speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerMode {
    /// Poll OBD2 PID 0x0D
    #[default]
    Active,
    /// Listen for a broadcast speed frame
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedUnit {
    #[default]
    Kmh,
    Mph,
}

impl SpeedUnit {
    pub fn from_kmh(self, kmh: f32) -> f32 {
        match self {
            SpeedUnit::Kmh => kmh,
            SpeedUnit::Mph => kmh * KMH_TO_MPH,
        }
    }
}

/// The fixed OBD2 vehicle-speed request.
pub fn speed_request_frame(request_id: u32) -> Result<CanFrame, CanError> {
    CanFrame::new(
        request_id,
        &[
            0x02,
            OBD_SERVICE_CURRENT_DATA,
            OBD_PID_VEHICLE_SPEED,
            OBD_PADDING,
            OBD_PADDING,
            OBD_PADDING,
            OBD_PADDING,
            OBD_PADDING,
        ],
    )
}

/// What an ECU answers to [`speed_request_frame`]. Used by the simulated ECU.
pub fn speed_response_frame(response_id: u32, kmh: u8) -> Result<CanFrame, CanError> {
    CanFrame::new(
        response_id,
        &[
            0x03,
            OBD_CURRENT_DATA_RESPONSE,
            OBD_PID_VEHICLE_SPEED,
            kmh,
            OBD_PADDING,
            OBD_PADDING,
            OBD_PADDING,
            OBD_PADDING,
        ],
    )
}

/// Decode a PID 0x0D response in km/h.
///
/// `Ok(None)` means a well-formed response for some other service or PID.
pub fn decode_obd_speed(frame: &CanFrame) -> Result<Option<f32>, DecodeError> {
    let data = frame.payload();
    if !OBD_RESPONSE_LENGTHS.contains(&data.len()) {
        return Err(DecodeError::Length {
            expected: &OBD_RESPONSE_LENGTHS,
            actual: data.len(),
        });
    }
    if data[1] == OBD_CURRENT_DATA_RESPONSE && data[2] == OBD_PID_VEHICLE_SPEED {
        Ok(Some(data[3] as f32))
    } else {
        Ok(None)
    }
}

/// Decode the broadcast speed frame in km/h.
pub fn decode_broadcast_speed(frame: &CanFrame) -> Result<f32, DecodeError> {
    let data = frame.payload();
    if data.len() != BROADCAST_SPEED_LENGTH {
        return Err(DecodeError::Length {
            expected: &[BROADCAST_SPEED_LENGTH],
            actual: data.len(),
        });
    }
    let centi_kmh = u16::from_be_bytes([data[3], data[4]]);
    Ok(centi_kmh as f32 / 100.0)
}

/// Records every matching broadcast frame.
pub struct PassiveSampler {
    frames: Receiver<CanFrame>,
    aggregator: Arc<Aggregator>,
    clock: Arc<dyn Clock>,
    unit: SpeedUnit,
}

impl PassiveSampler {
    pub fn new(
        bus: &dyn CanBus,
        config: &CanConfig,
        aggregator: Arc<Aggregator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CanError> {
        let filter = CanFilter::exact(config.broadcast_id, config.broadcast_extended);
        let frames = bus.add_rx_filter(filter, config.filter_queue_capacity)?;
        Ok(Self {
            frames,
            aggregator,
            clock,
            unit: config.speed_unit,
        })
    }

    /// Decode and record one frame.
    pub fn handle_frame(&self, frame: &CanFrame) -> Option<VehicleSample> {
        let kmh = match decode_broadcast_speed(frame) {
            Ok(kmh) => kmh,
            Err(e) => {
                warn!(%frame, error = %e, "skipping speed broadcast");
                return None;
            }
        };
        let sample = VehicleSample {
            value: self.unit.from_kmh(kmh),
            timestamp_ms: self.clock.uptime_ms(),
        };
        trace!(speed = sample.value, "broadcast speed");
        self.aggregator.record(sample).then_some(sample)
    }

    pub fn run(&self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            match self.frames.recv_timeout(STOP_CHECK) {
                Ok(frame) => {
                    self.handle_frame(&frame);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("CAN filter queue closed, passive sampler stopping");
                    break;
                }
            }
        }
    }
}

/// Result of one request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollOutcome {
    Sample(VehicleSample),
    /// No matching response inside the window
    NoData,
    /// The request could not be sent; recorded as no data
    SendFailed,
}

/// Polls OBD2 PID 0x0D on the sample interval.
pub struct ActivePoller {
    bus: Arc<dyn CanBus>,
    responses: Receiver<CanFrame>,
    request: CanFrame,
    send_timeout: Duration,
    response_timeout: Duration,
    aggregator: Arc<Aggregator>,
    settings: Arc<Settings>,
    clock: Arc<dyn Clock>,
    unit: SpeedUnit,
    wake: Receiver<SettingKey>,
}

impl ActivePoller {
    pub fn new(
        bus: Arc<dyn CanBus>,
        config: &CanConfig,
        aggregator: Arc<Aggregator>,
        settings: Arc<Settings>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CanError> {
        let request = speed_request_frame(config.request_id)?;
        let responses = bus.add_rx_filter(
            CanFilter::exact(config.response_id, false),
            config.filter_queue_capacity,
        )?;
        let wake = settings.subscribe();
        Ok(Self {
            bus,
            responses,
            request,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            aggregator,
            settings,
            clock,
            unit: config.speed_unit,
            wake,
        })
    }

    /// Send one request and collect responses until the window closes.
    pub fn poll_once(&self) -> PollOutcome {
        // Late answers to an earlier request would otherwise be read as fresh.
        while self.responses.try_recv().is_ok() {}

        if let Err(e) = self.bus.send(&self.request, self.send_timeout) {
            warn!(error = %e, "error sending speed request");
            self.aggregator.record_no_data();
            return PollOutcome::SendFailed;
        }

        let deadline = Instant::now() + self.response_timeout;
        let mut speed_kmh = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.responses.recv_timeout(remaining) {
                Ok(frame) => match decode_obd_speed(&frame) {
                    Ok(Some(kmh)) => speed_kmh = Some(kmh),
                    Ok(None) => trace!(%frame, "response for another PID"),
                    Err(e) => warn!(%frame, error = %e, "skipping speed response"),
                },
                Err(_) => break,
            }
        }

        match speed_kmh {
            Some(kmh) => {
                let sample = VehicleSample {
                    value: self.unit.from_kmh(kmh),
                    timestamp_ms: self.clock.uptime_ms(),
                };
                debug!(speed = sample.value, "vehicle speed");
                self.aggregator.record(sample);
                PollOutcome::Sample(sample)
            }
            None => {
                debug!("no vehicle speed response");
                self.aggregator.record_no_data();
                PollOutcome::NoData
            }
        }
    }

    pub fn run(&self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            self.poll_once();
            self.wait_for_next_poll(running);
        }
    }

    /// Sleep for the sample interval, cut short by a sample interval change or stop.
    fn wait_for_next_poll(&self, running: &AtomicBool) {
        let deadline = Instant::now() + self.settings.sample_interval();
        while running.load(Ordering::Acquire) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.wake.recv_timeout(remaining.min(STOP_CHECK)) {
                Ok(SettingKey::SampleInterval) => {
                    debug!("sample interval changed, polling now");
                    return;
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(remaining.min(STOP_CHECK)),
            }
        }
    }
}

/// The configured sampling strategy.
pub enum VehicleSampler {
    Passive(PassiveSampler),
    Active(ActivePoller),
}

impl VehicleSampler {
    /// Register the CAN filters for `config.mode`.
    pub fn new(
        config: &CanConfig,
        bus: Arc<dyn CanBus>,
        aggregator: Arc<Aggregator>,
        settings: Arc<Settings>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CanError> {
        match config.mode {
            SamplerMode::Passive => Ok(VehicleSampler::Passive(PassiveSampler::new(
                bus.as_ref(),
                config,
                aggregator,
                clock,
            )?)),
            SamplerMode::Active => Ok(VehicleSampler::Active(ActivePoller::new(
                bus, config, aggregator, settings, clock,
            )?)),
        }
    }

    pub fn mode(&self) -> SamplerMode {
        match self {
            VehicleSampler::Passive(_) => SamplerMode::Passive,
            VehicleSampler::Active(_) => SamplerMode::Active,
        }
    }

    pub fn run(&self, running: &AtomicBool) {
        match self {
            VehicleSampler::Passive(sampler) => sampler.run(running),
            VehicleSampler::Active(poller) => poller.run(running),
        }
    }

    /// Run on a dedicated thread until `running` is cleared.
    pub fn spawn(self, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("vehicle-sampler".into())
            .spawn(move || {
                info!(mode = ?self.mode(), "vehicle sampler started");
                self.run(&running);
                debug!("vehicle sampler stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::VirtualBus;
    use crate::clock::ManualClock;
    use crate::settings::{keys, SettingValue};

    fn test_config(mode: SamplerMode) -> CanConfig {
        CanConfig {
            mode,
            response_timeout_ms: 30,
            ..CanConfig::default()
        }
    }

    #[test]
    fn test_decode_obd_speed() {
        let frame = speed_response_frame(OBD_RESPONSE_ID, 88).unwrap();
        assert_eq!(decode_obd_speed(&frame), Ok(Some(88.0)));

        let four = CanFrame::new(OBD_RESPONSE_ID, &[0x03, 0x41, 0x0D, 12]).unwrap();
        assert_eq!(decode_obd_speed(&four), Ok(Some(12.0)));

        let rpm = CanFrame::new(OBD_RESPONSE_ID, &[0x04, 0x41, 0x0C, 0x1A, 0xF8, 0, 0, 0]).unwrap();
        assert_eq!(decode_obd_speed(&rpm), Ok(None));

        let short = CanFrame::new(OBD_RESPONSE_ID, &[0x03, 0x41, 0x0D]).unwrap();
        assert_eq!(
            decode_obd_speed(&short),
            Err(DecodeError::Length {
                expected: &OBD_RESPONSE_LENGTHS,
                actual: 3
            })
        );
    }

    #[test]
    fn test_decode_broadcast_speed() {
        let frame = CanFrame::new_extended(BROADCAST_SPEED_ID, &[0, 0, 0, 0x12, 0x34]).unwrap();
        assert_eq!(decode_broadcast_speed(&frame), Ok(46.6));

        let long = CanFrame::new_extended(BROADCAST_SPEED_ID, &[0; 6]).unwrap();
        assert!(decode_broadcast_speed(&long).is_err());
    }

    #[test]
    fn test_mph_conversion() {
        assert_eq!(SpeedUnit::Kmh.from_kmh(100.0), 100.0);
        assert!((SpeedUnit::Mph.from_kmh(100.0) - 62.137_51).abs() < 1e-4);
    }

    #[test]
    fn test_request_frame_layout() {
        let frame = speed_request_frame(OBD_REQUEST_ID).unwrap();
        assert_eq!(frame.id, 0x7DF);
        assert_eq!(
            frame.payload(),
            &[0x02, 0x01, 0x0D, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
        );
    }

    #[test]
    fn test_passive_sampler_records_matching_frames() {
        let bus = VirtualBus::new();
        let aggregator = Arc::new(Aggregator::default());
        let clock = Arc::new(ManualClock::new(500));
        let sampler = PassiveSampler::new(
            &bus,
            &test_config(SamplerMode::Passive),
            aggregator.clone(),
            clock,
        )
        .unwrap();

        bus.inject(CanFrame::new_extended(BROADCAST_SPEED_ID, &[0, 0, 0, 0x0F, 0xA0]).unwrap());
        bus.inject(CanFrame::new_extended(BROADCAST_SPEED_ID, &[0, 0, 0]).unwrap());
        while let Ok(frame) = sampler.frames.try_recv() {
            sampler.handle_frame(&frame);
        }

        let snapshot = aggregator.snapshot_and_reset().unwrap();
        assert_eq!(snapshot.window.count(), 1);
        assert_eq!(
            snapshot.latest,
            Some(VehicleSample {
                value: 40.0,
                timestamp_ms: 500
            })
        );
    }

    #[test]
    fn test_active_poll_last_matching_response_wins() {
        let bus = Arc::new(VirtualBus::new());
        bus.set_responder(|_| {
            vec![
                speed_response_frame(OBD_RESPONSE_ID, 50).unwrap(),
                CanFrame::new(OBD_RESPONSE_ID, &[0x03, 0x41]).unwrap(),
                speed_response_frame(OBD_RESPONSE_ID, 52).unwrap(),
            ]
        });
        let aggregator = Arc::new(Aggregator::default());
        let poller = ActivePoller::new(
            bus.clone(),
            &CanConfig {
                filter_queue_capacity: 4,
                ..test_config(SamplerMode::Active)
            },
            aggregator.clone(),
            Arc::new(Settings::default()),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();

        match poller.poll_once() {
            PollOutcome::Sample(sample) => assert_eq!(sample.value, 52.0),
            other => panic!("expected a sample, got {other:?}"),
        }
        assert_eq!(bus.sent(), 1);
        assert_eq!(aggregator.snapshot_and_reset().unwrap().window.count(), 1);
    }

    #[test]
    fn test_active_poll_without_answer_records_no_data() {
        let bus = Arc::new(VirtualBus::new());
        let aggregator = Arc::new(Aggregator::default());
        aggregator.record(VehicleSample {
            value: 30.0,
            timestamp_ms: 0,
        });
        let poller = ActivePoller::new(
            bus.clone(),
            &test_config(SamplerMode::Active),
            aggregator.clone(),
            Arc::new(Settings::default()),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();

        assert_eq!(poller.poll_once(), PollOutcome::NoData);
        assert_eq!(aggregator.snapshot_and_reset().unwrap().latest, None);

        bus.set_offline(true);
        assert_eq!(poller.poll_once(), PollOutcome::SendFailed);
    }

    #[test]
    fn test_sample_interval_change_wakes_poller() {
        let bus = Arc::new(VirtualBus::new());
        let settings = Arc::new(Settings::default());
        settings.set(keys::SAMPLE_INTERVAL_S, SettingValue::Int(43_200));
        let poller = ActivePoller::new(
            bus.clone(),
            &test_config(SamplerMode::Active),
            Arc::new(Aggregator::default()),
            settings.clone(),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::spawn(move || poller.run(&flag));

        let wait_for_sends = |count: u64| {
            let deadline = Instant::now() + Duration::from_secs(2);
            while bus.sent() < count && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            bus.sent()
        };
        assert_eq!(wait_for_sends(1), 1);

        // An unrelated key leaves the long wait in place.
        settings.set(keys::FIX_INTERVAL_S, SettingValue::Int(30));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(bus.sent(), 1);

        settings.set(keys::SAMPLE_INTERVAL_S, SettingValue::Int(1));
        assert!(wait_for_sends(2) >= 2);

        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_sampler_thread_stops_on_flag() {
        let bus: Arc<dyn CanBus> = Arc::new(VirtualBus::new());
        let running = Arc::new(AtomicBool::new(true));
        let sampler = VehicleSampler::new(
            &test_config(SamplerMode::Active),
            bus,
            Arc::new(Aggregator::default()),
            Arc::new(Settings::default()),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        assert_eq!(sampler.mode(), SamplerMode::Active);

        let handle = sampler.spawn(running.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }
}
