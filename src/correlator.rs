//! # Correlator
//!
//! Pairs each emitted fix with the vehicle data gathered since the previous one and
//! hands the result to the publish queue.
//!
//! There is no shared sequence number between the GNSS and CAN streams. The pairing is
//! best-effort: whatever the [`Aggregator`] holds when the fix is dequeued belongs to
//! that fix.
//!
//! ## Modes
//! - [`CorrelationMode::Latest`]: one discrete value, the latest speed reading
//! - [`CorrelationMode::Aggregate`]: the latest reading plus count/min/max/avg of the window
//!
//! ## Wire Shape (`"tracker"` stream)
//! ```json
//! {"time":"1994-03-23T12:35:19.000Z",
//!  "gps":{"lat":48.1173,"lon":11.5166667,"fake":false},
//!  "vehicle":{"speed":52,"count":3,"min":48.0,"max":55.0,"avg":51.7}}
//! ```
//! `time` is omitted for synthetic fixes. `speed` is `-1` when there is no reading.

use crate::aggregator::{AggregateSnapshot, AggregateWindow, Aggregator};
use crate::clock::Clock;
use crate::publish::{PublishQueue, Publishable, SinkError};
use crate::{Fix, FixEvent, VehicleSample};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TRACKER_STREAM: &str = "tracker";

/// Published speed when no reading is available.
pub const NO_SPEED: i32 = -1;

const STOP_CHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMode {
    #[default]
    Latest,
    Aggregate,
}

/// One fix with its vehicle data, ready for publishing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CorrelatedRecord {
    pub fix: Fix,
    /// Latest speed reading at correlation time
    pub speed: Option<VehicleSample>,
    /// Window since the previous record, in aggregate mode only
    pub window: Option<AggregateWindow>,
    pub fix_arrival_ms: u64,
    pub emitted_ms: u64,
}

#[derive(Serialize)]
struct TrackerPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    gps: GpsPayload,
    vehicle: VehiclePayload,
}

#[derive(Serialize)]
struct GpsPayload {
    lat: f64,
    lon: f64,
    fake: bool,
}

#[derive(Serialize)]
struct VehiclePayload {
    speed: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avg: Option<f32>,
}

impl CorrelatedRecord {
    fn payload(&self) -> TrackerPayload {
        let time = if self.fix.is_synthetic() {
            None
        } else {
            self.fix
                .timestamp()
                .map(|ts| ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        };

        TrackerPayload {
            time,
            gps: GpsPayload {
                lat: self.fix.latitude.to_degrees(),
                lon: self.fix.longitude.to_degrees(),
                fake: self.fix.is_synthetic(),
            },
            vehicle: VehiclePayload {
                speed: self.speed.map(|s| s.rounded()).unwrap_or(NO_SPEED),
                count: self.window.map(|w| w.count()),
                min: self.window.and_then(|w| w.min()),
                max: self.window.and_then(|w| w.max()),
                avg: self.window.and_then(|w| w.average()),
            },
        }
    }
}

impl Publishable for CorrelatedRecord {
    fn stream(&self) -> &'static str {
        TRACKER_STREAM
    }

    fn encode(&self) -> Result<Vec<u8>, SinkError> {
        Ok(serde_json::to_vec(&self.payload())?)
    }
}

pub struct Correlator {
    events: Receiver<FixEvent>,
    aggregator: Arc<Aggregator>,
    output: PublishQueue<CorrelatedRecord>,
    clock: Arc<dyn Clock>,
    mode: CorrelationMode,
}

impl Correlator {
    pub fn new(
        events: Receiver<FixEvent>,
        aggregator: Arc<Aggregator>,
        output: PublishQueue<CorrelatedRecord>,
        clock: Arc<dyn Clock>,
        mode: CorrelationMode,
    ) -> Self {
        Self {
            events,
            aggregator,
            output,
            clock,
            mode,
        }
    }

    /// Take the aggregator snapshot for `event` and build its record.
    ///
    /// If the shared state stays locked past its timeout, the record goes out with an
    /// empty window and no speed.
    pub fn correlate(&self, event: FixEvent) -> CorrelatedRecord {
        let snapshot = self.aggregator.snapshot_and_reset().unwrap_or_else(|| {
            warn!("correlating fix without vehicle data");
            AggregateSnapshot::default()
        });

        CorrelatedRecord {
            fix: event.fix,
            speed: snapshot.latest,
            window: match self.mode {
                CorrelationMode::Latest => None,
                CorrelationMode::Aggregate => Some(snapshot.window),
            },
            fix_arrival_ms: event.arrival_ms,
            emitted_ms: self.clock.uptime_ms(),
        }
    }

    /// Correlate and enqueue. Returns `false` if the publish queue was full.
    pub fn handle(&self, event: FixEvent) -> bool {
        let record = self.correlate(event);
        debug!(
            lat = record.fix.latitude.to_degrees(),
            lon = record.fix.longitude.to_degrees(),
            fake = record.fix.is_synthetic(),
            speed = record.speed.map(|s| s.rounded()).unwrap_or(NO_SPEED),
            "GPS position"
        );
        match self.output.try_push(record) {
            Ok(()) => true,
            Err(_) => {
                warn!("publish queue full, dropping newest record");
                false
            }
        }
    }

    /// Process fix events until `running` is cleared, then drain what is left.
    pub fn run(&self, running: &AtomicBool) {
        loop {
            match self.events.recv_timeout(STOP_CHECK) {
                Ok(event) => {
                    self.handle(event);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        while let Ok(event) = self.events.try_recv() {
            self.handle(event);
        }
    }

    pub fn spawn(self, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("correlator".into())
            .spawn(move || {
                info!(mode = ?self.mode, "correlator started");
                self.run(&running);
                debug!("correlator stopped");
            })
    }
}
