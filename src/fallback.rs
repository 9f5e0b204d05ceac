//! # Synthetic Fix Fallback
//!
//! When the receiver reports no satellite lock and synthetic fixes are enabled, the
//! tracker substitutes a fix built from the configured coordinates instead of going
//! silent. This keeps a stationary test rig (or a vehicle parked under a roof) producing
//! correlated records.
//!
//! ## Substitution Rules
//! - **Coordinates**: taken from the synthetic latitude/longitude settings
//! - **Validity**: forced to `true`
//! - **Source**: marked [`FixSource::Synthetic`], which becomes `"fake": true` on the wire
//! - **Date/time**: whatever the receiver reported is carried over unchanged. An
//!   unlocked receiver often still knows the time from its RTC, but the published
//!   record omits it for synthetic fixes.
//!
//! Runs on the serial receive path: only atomic loads from [`Settings`], no allocation.

use crate::settings::Settings;
use crate::{Coordinate, Fix, FixSource};

/// Build the substitute for an unlocked `observed` fix.
///
/// Returns `None` when synthetic fixes are disabled.
pub fn synthetic_fix(observed: &Fix, settings: &Settings) -> Option<Fix> {
    if !settings.synthetic_enabled() {
        return None;
    }
    let (lat, lon) = settings.synthetic_coordinates();

    Some(Fix {
        latitude: Coordinate::from_degrees(lat)?,
        longitude: Coordinate::from_degrees(lon)?,
        date: observed.date,
        time: observed.time,
        valid: true,
        source: FixSource::Synthetic,
    })
}
