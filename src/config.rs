//! # Configuration Management
//!
//! This module handles loading and parsing configuration from the tracker-config.toml file.
//! It covers the static wiring of the tracker: queue capacities, the CAN sampling mode
//! and its protocol identifiers, the correlation mode, and the initial values of the
//! runtime settings (which the remote settings channel may change later).
//!
//! Every section has defaults, so a partial file (or none at all) is valid.

use crate::can::{MAX_EXTENDED_ID, MAX_STANDARD_ID};
use crate::correlator::CorrelationMode;
use crate::sampler::{
    SamplerMode, SpeedUnit, BROADCAST_SPEED_ID, OBD_REQUEST_ID, OBD_RESPONSE_ID,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Default configuration file name
pub const CONFIG_FILE: &str = "tracker-config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file format: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration loaded from tracker-config.toml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// GNSS ingestion
    pub gnss: GnssConfig,
    /// Vehicle speed sampling over CAN
    pub can: CanConfig,
    /// Initial runtime settings
    pub settings: InitialSettings,
    /// Fix/vehicle correlation
    pub correlation: CorrelationConfig,
    /// Publish queue
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GnssConfig {
    /// Capacity of the fix event queue (drop-newest when full)
    pub fix_queue_capacity: usize,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            fix_queue_capacity: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CanConfig {
    /// `active` polls OBD2, `passive` listens for a broadcast
    pub mode: SamplerMode,
    /// Broadcast speed frame identifier (passive mode)
    pub broadcast_id: u32,
    pub broadcast_extended: bool,
    /// OBD2 functional request identifier (active mode)
    pub request_id: u32,
    /// OBD2 response identifier (active mode)
    pub response_id: u32,
    pub send_timeout_ms: u64,
    /// How long each poll collects responses
    pub response_timeout_ms: u64,
    /// Capacity of each CAN filter queue
    pub filter_queue_capacity: usize,
    pub speed_unit: SpeedUnit,
    /// Raw frame forwarding to the "can" stream, off when absent
    pub forward: Option<ForwardConfig>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            mode: SamplerMode::Active,
            broadcast_id: BROADCAST_SPEED_ID,
            broadcast_extended: true,
            request_id: OBD_REQUEST_ID,
            response_id: OBD_RESPONSE_ID,
            send_timeout_ms: 100,
            response_timeout_ms: 500,
            filter_queue_capacity: 2,
            speed_unit: SpeedUnit::Kmh,
            forward: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub id: u32,
    pub extended: bool,
    pub queue_capacity: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            id: 0x123,
            extended: true,
            queue_capacity: 2,
        }
    }
}

/// Starting values for the runtime settings, applied through the validated setters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InitialSettings {
    pub loop_delay_s: i64,
    pub fix_interval_s: i64,
    pub sample_interval_s: i64,
    pub synthetic_enabled: bool,
    pub synthetic_latitude: f64,
    pub synthetic_longitude: f64,
}

impl Default for InitialSettings {
    fn default() -> Self {
        Self {
            loop_delay_s: 5,
            fix_interval_s: 3,
            sample_interval_s: 1,
            synthetic_enabled: false,
            synthetic_latitude: 37.789_980,
            synthetic_longitude: -122.400_860,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub mode: CorrelationMode,
    /// Bounded wait on the shared vehicle state
    pub lock_timeout_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            mode: CorrelationMode::Latest,
            lock_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishConfig {
    pub queue_capacity: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

impl Config {
    /// Load configuration from tracker-config.toml file
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::try_load_from_path(path) {
            Ok(config) => {
                info!(path = %path.display(), mode = ?config.can.mode, "loaded configuration");
                config
            }
            Err(ConfigError::Io(_)) => {
                info!(path = %path.display(), "no config file found, using default configuration");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    /// Load and validate, without falling back.
    pub fn try_load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save current configuration as pretty TOML
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;
        info!(path = %path.as_ref().display(), "configuration saved");
        Ok(())
    }

    /// Check the values serde cannot: non-zero capacities and identifier widths.
    ///
    /// Runtime settings are not checked here; the setters reject them individually.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("gnss.fix_queue_capacity", self.gnss.fix_queue_capacity),
            ("can.filter_queue_capacity", self.can.filter_queue_capacity),
            ("publish.queue_capacity", self.publish.queue_capacity),
        ];
        for (name, capacity) in capacities {
            if capacity == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }

        let ids = [
            ("can.broadcast_id", self.can.broadcast_id, self.can.broadcast_extended),
            ("can.request_id", self.can.request_id, false),
            ("can.response_id", self.can.response_id, false),
        ];
        for (name, id, extended) in ids {
            check_id(name, id, extended)?;
        }

        if let Some(forward) = &self.can.forward {
            check_id("can.forward.id", forward.id, forward.extended)?;
            if forward.queue_capacity == 0 {
                return Err(ConfigError::Invalid(
                    "can.forward.queue_capacity must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn check_id(name: &str, id: u32, extended: bool) -> Result<(), ConfigError> {
    let max = if extended {
        MAX_EXTENDED_ID
    } else {
        MAX_STANDARD_ID
    };
    if id > max {
        return Err(ConfigError::Invalid(format!(
            "{name} {id:#X} does not fit a {} identifier",
            if extended { "29-bit" } else { "11-bit" }
        )));
    }
    Ok(())
}
