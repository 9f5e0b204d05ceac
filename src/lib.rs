//! # CAN Asset Tracker Core Library
//!
//! This library is the acquisition-and-fusion core of a vehicle telemetry tracker. It
//! ingests two independent sensor streams and produces one stream of time-correlated
//! records ready for upload:
//!
//! - A GNSS receiver emitting NMEA sentences over a serial line, one or a few bytes at a time
//! - A vehicle CAN bus emitting either broadcast speed frames or polled OBD2 responses
//!
//! ## Design Philosophy
//!
//! ### Bounded Everything
//! - **Fixed-capacity buffers**: the sentence assembler owns a single 128-byte line buffer
//! - **Bounded queues**: every queue has a capacity and drops the newest item when full
//! - **Bounded waits**: the only shared state is guarded by a mutex acquired with a timeout
//!
//! ### Never Block the Receive Path
//! Serial bytes arrive on an interrupt-like path. Assembly, parsing, gating and enqueueing
//! all run synchronously on that path, so each step is allocation-free and uses
//! `try_*` queue operations only.
//!
//! ### Data Flow
//! ```text
//! bytes → SentenceAssembler → FixFilter → FixEvent queue → Correlator → PublishQueue → Publisher → Sink
//!                                                              ↑
//!                       CAN frames → VehicleSampler → Aggregator
//! ```
//!
//! ## Core Types
//!
//! The library exports the value types that cross queue boundaries:
//! - [`Coordinate`]: fixed-point degrees
//! - [`Fix`]: a decoded GNSS position/time report, real or synthetic
//! - [`FixEvent`]: a fix plus its arrival uptime
//! - [`VehicleSample`]: a decoded, unit-converted vehicle speed

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

// Module declarations
pub mod aggregator;
pub mod assembler;
pub mod can;
pub mod clock;
pub mod config;
pub mod correlator;
pub mod fallback;
pub mod fix_filter;
pub mod forwarder;
pub mod logging;
pub mod nmea;
pub mod publish;
pub mod sampler;
pub mod settings;
pub mod tracker;

/// Fixed-point angle in units of 1e-7 degrees.
///
/// Seven decimal places is ~1 cm at the equator, and ±180° still fits in an `i32`
/// (±1.8e9 against a limit of ±2.147e9).
///
/// # Example
/// ```
/// use asset_tracker_lib::Coordinate;
///
/// let lat = Coordinate::from_degrees(48.1173).unwrap();
/// assert_eq!(lat.raw(), 481_173_000);
/// assert!((lat.to_degrees() - 48.1173).abs() < 1e-9);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coordinate(i32);

impl Coordinate {
    /// Units per degree
    pub const SCALE: f64 = 10_000_000.0;

    /// Zero degrees (what an empty NMEA coordinate field decodes to)
    pub const ZERO: Coordinate = Coordinate(0);

    /// Convert decimal degrees. Returns `None` for non-finite values or anything
    /// outside ±180°.
    pub fn from_degrees(degrees: f64) -> Option<Self> {
        if !degrees.is_finite() || !(-180.0..=180.0).contains(&degrees) {
            return None;
        }
        Some(Coordinate((degrees * Self::SCALE).round() as i32))
    }

    /// Build from raw 1e-7 degree units.
    pub const fn from_raw(raw: i32) -> Self {
        Coordinate(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub fn to_degrees(self) -> f64 {
        self.0 as f64 / Self::SCALE
    }
}

/// Where a [`Fix`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixSource {
    /// Decoded from the receiver with a satellite lock
    Satellite,
    /// Substituted from configured coordinates because no lock existed
    Synthetic,
}

/// A decoded GNSS position/time report.
///
/// `valid` reflects whether the receiver had a satellite lock. Synthetic fixes are
/// forced valid and carry [`FixSource::Synthetic`] so downstream consumers can still
/// tell them apart.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: Coordinate,
    pub longitude: Coordinate,
    /// UTC date, if the receiver reported one
    pub date: Option<NaiveDate>,
    /// UTC time of day, if the receiver reported one
    pub time: Option<NaiveTime>,
    pub valid: bool,
    pub source: FixSource,
}

impl Fix {
    pub fn is_synthetic(&self) -> bool {
        self.source == FixSource::Synthetic
    }

    /// Full UTC timestamp when both date and time are present.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        Some(NaiveDateTime::new(self.date?, self.time?))
    }
}

/// A fix accepted by the minimum-interval gate, stamped with uptime at arrival.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixEvent {
    pub fix: Fix,
    /// Uptime in milliseconds when the sentence was accepted
    pub arrival_ms: u64,
}

/// One decoded vehicle speed reading.
///
/// `value` is already converted to the configured unit (km/h or mph).
///
/// # Example
/// ```
/// use asset_tracker_lib::VehicleSample;
///
/// let sample = VehicleSample { value: 42.0, timestamp_ms: 1_500 };
/// assert_eq!(sample.rounded(), 42);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleSample {
    /// Speed in the configured unit
    pub value: f32,
    /// Uptime in milliseconds when the frame was decoded
    pub timestamp_ms: u64,
}

impl VehicleSample {
    /// Speed rounded to the nearest whole unit, as published on the wire.
    pub fn rounded(&self) -> i32 {
        self.value.round() as i32
    }
}
