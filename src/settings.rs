//! # Runtime Settings
//!
//! Typed, range-validated tunables pushed by the remote settings channel. Each key has a
//! declared type and bound in a static registry, and every `set` produces exactly one
//! [`SettingOutcome`]:
//!
//! | outcome          | stored value |
//! |------------------|--------------|
//! | `Updated`        | replaced     |
//! | `Unchanged`      | equal value was already stored, nothing notified |
//! | `RejectedRange`  | untouched    |
//! | `RejectedType`   | untouched    |
//! | `Unrecognized`   | untouched    |
//!
//! Values live in atomics so the serial receive path can read them without locking.
//! Writers are serialized by a small mutex so compare-then-store is atomic per key.

use crate::config::InitialSettings;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Wire names of the settings keys.
pub mod keys {
    /// Publish cadence of the driving loop, seconds
    pub const LOOP_DELAY_S: &str = "LOOP_DELAY_S";
    /// Minimum interval between emitted fixes, seconds
    pub const FIX_INTERVAL_S: &str = "GPS_DELAY_S";
    /// Active-mode vehicle speed poll period, seconds
    pub const SAMPLE_INTERVAL_S: &str = "VEHICLE_SPEED_DELAY_S";
    pub const SYNTHETIC_ENABLED: &str = "FAKE_GPS_ENABLED";
    pub const SYNTHETIC_LATITUDE: &str = "FAKE_GPS_LATITUDE";
    pub const SYNTHETIC_LONGITUDE: &str = "FAKE_GPS_LONGITUDE";
}

/// Upper bound shared by every interval setting (12 hours).
pub const MAX_INTERVAL_S: i64 = 43_200;

/// Capacity of each change-notification channel.
const WATCH_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    LoopDelay,
    FixInterval,
    SampleInterval,
    SyntheticEnabled,
    SyntheticLatitude,
    SyntheticLongitude,
}

impl SettingKey {
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        REGISTRY.iter().find(|spec| spec.name == name).map(|spec| spec.key)
    }

    fn spec(self) -> &'static SettingSpec {
        // Every key has exactly one registry entry.
        REGISTRY
            .iter()
            .find(|spec| spec.key == self)
            .unwrap_or(&REGISTRY[0])
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared type and bound of a setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingKind {
    Integer { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Boolean,
}

struct SettingSpec {
    key: SettingKey,
    name: &'static str,
    kind: SettingKind,
}

static REGISTRY: [SettingSpec; 6] = [
    SettingSpec {
        key: SettingKey::LoopDelay,
        name: keys::LOOP_DELAY_S,
        kind: SettingKind::Integer {
            min: 1,
            max: MAX_INTERVAL_S,
        },
    },
    SettingSpec {
        key: SettingKey::FixInterval,
        name: keys::FIX_INTERVAL_S,
        kind: SettingKind::Integer {
            min: 0,
            max: MAX_INTERVAL_S,
        },
    },
    SettingSpec {
        key: SettingKey::SampleInterval,
        name: keys::SAMPLE_INTERVAL_S,
        kind: SettingKind::Integer {
            min: 0,
            max: MAX_INTERVAL_S,
        },
    },
    SettingSpec {
        key: SettingKey::SyntheticEnabled,
        name: keys::SYNTHETIC_ENABLED,
        kind: SettingKind::Boolean,
    },
    SettingSpec {
        key: SettingKey::SyntheticLatitude,
        name: keys::SYNTHETIC_LATITUDE,
        kind: SettingKind::Float {
            min: -90.0,
            max: 90.0,
        },
    },
    SettingSpec {
        key: SettingKey::SyntheticLongitude,
        name: keys::SYNTHETIC_LONGITUDE,
        kind: SettingKind::Float {
            min: -180.0,
            max: 180.0,
        },
    },
];

/// A value as it arrives from the settings channel, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Text(v.to_string())
    }
}

impl From<&serde_json::Value> for SettingValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => SettingValue::Bool(*b),
            // Integers past i64::MAX saturate so they fail the range check, not the type check.
            serde_json::Value::Number(n) if n.is_u64() => {
                SettingValue::Int(n.as_i64().unwrap_or(i64::MAX))
            }
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SettingValue::Int(i),
                None => SettingValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => SettingValue::Text(s.clone()),
            other => SettingValue::Text(other.to_string()),
        }
    }
}

/// Result of one `set` call. Exactly one per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingOutcome {
    Unchanged,
    Updated,
    RejectedRange,
    RejectedType,
    Unrecognized,
}

impl SettingOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, SettingOutcome::Unchanged | SettingOutcome::Updated)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("desired settings document is not a JSON object")]
    NotAnObject,
}

/// Validated value, already narrowed to its storage type.
#[derive(Debug, Clone, Copy)]
enum Validated {
    Int(u32),
    Float(f32),
    Bool(bool),
}

/// "Actual state" report of every setting, keyed by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    #[serde(rename = "LOOP_DELAY_S")]
    pub loop_delay_s: u32,
    #[serde(rename = "GPS_DELAY_S")]
    pub fix_interval_s: u32,
    #[serde(rename = "VEHICLE_SPEED_DELAY_S")]
    pub sample_interval_s: u32,
    #[serde(rename = "FAKE_GPS_ENABLED")]
    pub synthetic_enabled: bool,
    #[serde(rename = "FAKE_GPS_LATITUDE")]
    pub synthetic_latitude: f32,
    #[serde(rename = "FAKE_GPS_LONGITUDE")]
    pub synthetic_longitude: f32,
}

/// Process-wide settings store.
pub struct Settings {
    loop_delay_s: AtomicU32,
    fix_interval_s: AtomicU32,
    sample_interval_s: AtomicU32,
    synthetic_enabled: AtomicBool,
    /// `f32` bit patterns
    synthetic_latitude: AtomicU32,
    synthetic_longitude: AtomicU32,
    writer: Mutex<()>,
    watchers: Mutex<Vec<Sender<SettingKey>>>,
}

impl Default for Settings {
    fn default() -> Self {
        let initial = InitialSettings::default();
        Self {
            loop_delay_s: AtomicU32::new(initial.loop_delay_s as u32),
            fix_interval_s: AtomicU32::new(initial.fix_interval_s as u32),
            sample_interval_s: AtomicU32::new(initial.sample_interval_s as u32),
            synthetic_enabled: AtomicBool::new(initial.synthetic_enabled),
            synthetic_latitude: AtomicU32::new((initial.synthetic_latitude as f32).to_bits()),
            synthetic_longitude: AtomicU32::new((initial.synthetic_longitude as f32).to_bits()),
            writer: Mutex::new(()),
            watchers: Mutex::new(Vec::new()),
        }
    }
}

impl Settings {
    /// Start from defaults and apply configured initial values through the
    /// validated setters. Rejected values are logged and the default is kept.
    pub fn with_initial(initial: &InitialSettings) -> Self {
        let settings = Settings::default();
        let values: [(&str, SettingValue); 6] = [
            (keys::LOOP_DELAY_S, initial.loop_delay_s.into()),
            (keys::FIX_INTERVAL_S, initial.fix_interval_s.into()),
            (keys::SAMPLE_INTERVAL_S, initial.sample_interval_s.into()),
            (keys::SYNTHETIC_ENABLED, initial.synthetic_enabled.into()),
            (keys::SYNTHETIC_LATITUDE, initial.synthetic_latitude.into()),
            (keys::SYNTHETIC_LONGITUDE, initial.synthetic_longitude.into()),
        ];
        for (key, value) in values {
            let outcome = settings.set(key, value.clone());
            if !outcome.is_accepted() {
                warn!(key, ?value, ?outcome, "ignoring configured initial setting");
            }
        }
        settings
    }

    /// Validate and apply one key/value pair.
    pub fn set(&self, key: &str, value: SettingValue) -> SettingOutcome {
        let Some(spec) = REGISTRY.iter().find(|spec| spec.name == key) else {
            debug!(key, "unrecognized setting key");
            return SettingOutcome::Unrecognized;
        };

        let validated = match validate(spec.kind, &value) {
            Ok(validated) => validated,
            Err(outcome) => {
                debug!(key, ?value, ?outcome, "rejected setting");
                return outcome;
            }
        };

        let changed = {
            let _writer = self.writer.lock();
            self.store(spec.key, validated)
        };

        if !changed {
            debug!(key, "setting already matches local value");
            return SettingOutcome::Unchanged;
        }

        info!(key, ?value, "setting updated");
        self.notify(spec.key);
        SettingOutcome::Updated
    }

    /// Apply a desired-state JSON object, one outcome per member in document order.
    pub fn apply_desired(
        &self,
        desired: &serde_json::Value,
    ) -> Result<Vec<(String, SettingOutcome)>, SettingsError> {
        let object = desired.as_object().ok_or(SettingsError::NotAnObject)?;
        Ok(object
            .iter()
            .map(|(key, value)| (key.clone(), self.set(key, SettingValue::from(value))))
            .collect())
    }

    /// Receive the key of every subsequent `Updated` outcome.
    ///
    /// Notifications are try-sent; a slow subscriber misses wake-ups rather than
    /// stalling a setter.
    pub fn subscribe(&self) -> Receiver<SettingKey> {
        let (tx, rx) = crossbeam_channel::bounded(WATCH_CAPACITY);
        self.watchers.lock().push(tx);
        rx
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            loop_delay_s: self.loop_delay_s(),
            fix_interval_s: self.fix_interval_s(),
            sample_interval_s: self.sample_interval_s(),
            synthetic_enabled: self.synthetic_enabled(),
            synthetic_latitude: f32::from_bits(self.synthetic_latitude.load(Ordering::Acquire)),
            synthetic_longitude: f32::from_bits(self.synthetic_longitude.load(Ordering::Acquire)),
        }
    }

    pub fn loop_delay_s(&self) -> u32 {
        self.loop_delay_s.load(Ordering::Acquire)
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_secs(self.loop_delay_s() as u64)
    }

    pub fn fix_interval_s(&self) -> u32 {
        self.fix_interval_s.load(Ordering::Acquire)
    }

    pub fn sample_interval_s(&self) -> u32 {
        self.sample_interval_s.load(Ordering::Acquire)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_s() as u64)
    }

    pub fn synthetic_enabled(&self) -> bool {
        self.synthetic_enabled.load(Ordering::Acquire)
    }

    /// Configured synthetic (latitude, longitude) in degrees.
    pub fn synthetic_coordinates(&self) -> (f64, f64) {
        let lat = f32::from_bits(self.synthetic_latitude.load(Ordering::Acquire));
        let lon = f32::from_bits(self.synthetic_longitude.load(Ordering::Acquire));
        (lat as f64, lon as f64)
    }

    /// Store a validated value, returning whether it differed from the old one.
    fn store(&self, key: SettingKey, value: Validated) -> bool {
        match (key, value) {
            (SettingKey::LoopDelay, Validated::Int(v)) => swap_u32(&self.loop_delay_s, v),
            (SettingKey::FixInterval, Validated::Int(v)) => swap_u32(&self.fix_interval_s, v),
            (SettingKey::SampleInterval, Validated::Int(v)) => {
                swap_u32(&self.sample_interval_s, v)
            }
            (SettingKey::SyntheticEnabled, Validated::Bool(v)) => {
                self.synthetic_enabled.swap(v, Ordering::AcqRel) != v
            }
            (SettingKey::SyntheticLatitude, Validated::Float(v)) => {
                swap_f32(&self.synthetic_latitude, v)
            }
            (SettingKey::SyntheticLongitude, Validated::Float(v)) => {
                swap_f32(&self.synthetic_longitude, v)
            }
            // The registry pairs each key with one kind, so no other combination
            // reaches here.
            _ => false,
        }
    }

    fn notify(&self, key: SettingKey) {
        self.watchers.lock().retain(|tx| match tx.try_send(key) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

fn validate(kind: SettingKind, value: &SettingValue) -> Result<Validated, SettingOutcome> {
    match (kind, value) {
        (SettingKind::Integer { min, max }, SettingValue::Int(v)) => {
            if (min..=max).contains(v) {
                Ok(Validated::Int(*v as u32))
            } else {
                Err(SettingOutcome::RejectedRange)
            }
        }
        (SettingKind::Float { min, max }, SettingValue::Float(v)) => {
            if v.is_finite() && (min..=max).contains(v) {
                Ok(Validated::Float(*v as f32))
            } else {
                Err(SettingOutcome::RejectedRange)
            }
        }
        (SettingKind::Boolean, SettingValue::Bool(v)) => Ok(Validated::Bool(*v)),
        _ => Err(SettingOutcome::RejectedType),
    }
}

fn swap_u32(slot: &AtomicU32, value: u32) -> bool {
    slot.swap(value, Ordering::AcqRel) != value
}

fn swap_f32(slot: &AtomicU32, value: f32) -> bool {
    f32::from_bits(slot.swap(value.to_bits(), Ordering::AcqRel)) != value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fix_interval_bounds() {
        let settings = Settings::default();
        assert_eq!(
            settings.set(keys::FIX_INTERVAL_S, SettingValue::Int(-1)),
            SettingOutcome::RejectedRange
        );
        assert_eq!(
            settings.set(keys::FIX_INTERVAL_S, SettingValue::Int(43_200)),
            SettingOutcome::Updated
        );
        assert_eq!(
            settings.set(keys::FIX_INTERVAL_S, SettingValue::Int(43_201)),
            SettingOutcome::RejectedRange
        );
        assert_eq!(settings.fix_interval_s(), 43_200);
    }

    #[test]
    fn test_setting_equal_value_is_unchanged_and_silent() {
        let settings = Settings::default();
        let watcher = settings.subscribe();
        let current = settings.fix_interval_s() as i64;

        assert_eq!(
            settings.set(keys::FIX_INTERVAL_S, SettingValue::Int(current)),
            SettingOutcome::Unchanged
        );
        assert!(watcher.try_recv().is_err());
    }

    #[test]
    fn test_wrong_type_leaves_value_untouched() {
        let settings = Settings::default();
        let before = settings.snapshot();

        assert_eq!(
            settings.set(keys::FIX_INTERVAL_S, SettingValue::Float(2.0)),
            SettingOutcome::RejectedType
        );
        assert_eq!(
            settings.set(keys::SYNTHETIC_LATITUDE, SettingValue::Int(10)),
            SettingOutcome::RejectedType
        );
        assert_eq!(
            settings.set(keys::SYNTHETIC_ENABLED, "yes".into()),
            SettingOutcome::RejectedType
        );
        assert_eq!(settings.snapshot(), before);
    }

    #[test]
    fn test_unrecognized_key() {
        let settings = Settings::default();
        assert_eq!(
            settings.set("BATTERY_DELAY_S", SettingValue::Int(5)),
            SettingOutcome::Unrecognized
        );
    }

    #[test]
    fn test_coordinate_bounds() {
        let settings = Settings::default();
        assert_eq!(
            settings.set(keys::SYNTHETIC_LATITUDE, SettingValue::Float(90.5)),
            SettingOutcome::RejectedRange
        );
        assert_eq!(
            settings.set(keys::SYNTHETIC_LONGITUDE, SettingValue::Float(f64::NAN)),
            SettingOutcome::RejectedRange
        );
        assert_eq!(
            settings.set(keys::SYNTHETIC_LONGITUDE, SettingValue::Float(-180.0)),
            SettingOutcome::Updated
        );
        let (_, lon) = settings.synthetic_coordinates();
        assert_eq!(lon, -180.0);
    }

    #[test]
    fn test_loop_delay_lower_bound_is_one() {
        let settings = Settings::default();
        assert_eq!(
            settings.set(keys::LOOP_DELAY_S, SettingValue::Int(0)),
            SettingOutcome::RejectedRange
        );
        assert_eq!(
            settings.set(keys::SAMPLE_INTERVAL_S, SettingValue::Int(0)),
            SettingOutcome::Updated
        );
    }

    #[test]
    fn test_update_notifies_subscribers() {
        let settings = Settings::default();
        let watcher = settings.subscribe();
        assert_eq!(
            settings.set(keys::SAMPLE_INTERVAL_S, SettingValue::Int(30)),
            SettingOutcome::Updated
        );
        assert_eq!(watcher.try_recv(), Ok(SettingKey::SampleInterval));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let settings = Settings::default();
        drop(settings.subscribe());
        settings.set(keys::SAMPLE_INTERVAL_S, SettingValue::Int(30));
        assert!(settings.watchers.lock().is_empty());
    }

    #[test]
    fn test_apply_desired_reports_each_key() {
        let settings = Settings::default();
        let outcomes = settings
            .apply_desired(&json!({
                "FAKE_GPS_ENABLED": true,
                "FAKE_GPS_LATITUDE": 51.5,
                "GPS_DELAY_S": "often",
                "UNKNOWN": 1
            }))
            .unwrap();

        let lookup = |key: &str| {
            outcomes
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, outcome)| *outcome)
        };
        assert_eq!(lookup("FAKE_GPS_ENABLED"), Some(SettingOutcome::Updated));
        assert_eq!(lookup("FAKE_GPS_LATITUDE"), Some(SettingOutcome::Updated));
        assert_eq!(lookup("GPS_DELAY_S"), Some(SettingOutcome::RejectedType));
        assert_eq!(lookup("UNKNOWN"), Some(SettingOutcome::Unrecognized));
        assert!(settings.synthetic_enabled());

        assert_eq!(
            settings.apply_desired(&json!([1, 2])),
            Err(SettingsError::NotAnObject)
        );
    }

    #[test]
    fn test_oversized_integer_is_out_of_range() {
        let settings = Settings::default();
        let outcomes = settings
            .apply_desired(&json!({ "GPS_DELAY_S": u64::MAX }))
            .unwrap();
        assert_eq!(
            outcomes,
            vec![("GPS_DELAY_S".to_string(), SettingOutcome::RejectedRange)]
        );
        assert_eq!(
            SettingValue::from(&json!(u64::MAX)),
            SettingValue::Int(i64::MAX)
        );
    }

    #[test]
    fn test_snapshot_fed_back_is_all_unchanged() {
        let settings = Settings::default();
        let document = serde_json::to_value(settings.snapshot()).unwrap();
        let outcomes = settings.apply_desired(&document).unwrap();
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes
            .iter()
            .all(|(_, outcome)| *outcome == SettingOutcome::Unchanged));
    }

    #[test]
    fn test_with_initial_keeps_default_for_rejected_values() {
        let initial = InitialSettings {
            fix_interval_s: 99_999,
            sample_interval_s: 7,
            ..InitialSettings::default()
        };
        let settings = Settings::with_initial(&initial);
        assert_eq!(
            settings.fix_interval_s() as i64,
            InitialSettings::default().fix_interval_s
        );
        assert_eq!(settings.sample_interval_s(), 7);
    }

    #[test]
    fn test_key_names_round_trip() {
        for spec in REGISTRY.iter() {
            assert_eq!(SettingKey::from_name(spec.name), Some(spec.key));
            assert_eq!(spec.key.name(), spec.name);
        }
    }
}
