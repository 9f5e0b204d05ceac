//! # NMEA RMC Parsing
//!
//! A small, trusted parser for the one sentence type the tracker cares about:
//! RMC ("recommended minimum"), from any talker (`$GPRMC`, `$GNRMC`, ...).
//!
//! ## Constraints
//!
//! This runs on the serial receive path, so it must not allocate:
//! - Fields are split into a fixed array of `&str` slices borrowed from the sentence
//! - Numbers are parsed in place, no intermediate `String`s
//! - The returned [`Fix`] is `Copy` and owns no borrow into the caller's buffer
//!
//! ## Accepted Shape
//! ```text
//! $GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A
//!        time   st lat      ns lon       ew speed course date
//! ```
//! A trailing `*hh` checksum is verified when present. Sentences from receivers that
//! have no lock (`V` status) usually leave the coordinate fields empty; those decode
//! to zero so the caller can still decide whether to substitute a synthetic fix.

use crate::{Coordinate, Fix, FixSource};
use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

/// Most fields any RMC revision carries (NMEA 4.1 adds a nav status field).
const MAX_FIELDS: usize = 14;

/// Fields 0..=9 (through the date) must be present.
const MIN_RMC_FIELDS: usize = 10;

/// Sentence classification, decided from the address field alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceId {
    Rmc,
    /// Well-formed address of some other type (GGA, GSV, ...)
    Other,
    /// Not an NMEA sentence at all
    Invalid,
}

/// Reasons an RMC sentence is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingStart,

    #[error("not an RMC sentence")]
    NotRmc,

    #[error("malformed checksum field")]
    BadChecksumField,

    #[error("checksum mismatch: sentence says {expected:02X}, computed {computed:02X}")]
    Checksum { expected: u8, computed: u8 },

    #[error("too few fields: {0}")]
    FieldCount(usize),

    #[error("invalid {0} field")]
    InvalidField(&'static str),
}

/// Classify a sentence by its address field (`$ttsss`).
pub fn sentence_id(sentence: &str) -> SentenceId {
    let Some(body) = sentence.strip_prefix('$') else {
        return SentenceId::Invalid;
    };
    let address = body.split([',', '*']).next().unwrap_or("");
    if address.len() != 5 || !address.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return SentenceId::Invalid;
    }
    if &address[2..] == "RMC" {
        SentenceId::Rmc
    } else {
        SentenceId::Other
    }
}

/// Parse an RMC sentence into a [`Fix`].
///
/// Trailing CR/LF is ignored. Invalid-status sentences parse successfully with
/// `valid == false`.
///
/// # Example
/// ```
/// use asset_tracker_lib::nmea::parse_rmc;
///
/// let fix = parse_rmc("$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n").unwrap();
/// assert!(fix.valid);
/// assert!((fix.latitude.to_degrees() - 48.1173).abs() < 1e-4);
/// ```
pub fn parse_rmc(sentence: &str) -> Result<Fix, NmeaError> {
    let line = sentence.trim_end_matches(['\r', '\n', '\0']);
    let body = line.strip_prefix('$').ok_or(NmeaError::MissingStart)?;
    let data = verify_checksum(body)?;

    let mut fields = [""; MAX_FIELDS];
    let mut count = 0;
    for field in data.split(',') {
        if count < MAX_FIELDS {
            fields[count] = field;
        }
        count += 1;
    }

    let address = fields[0];
    if address.len() != 5 || !address.ends_with("RMC") {
        return Err(NmeaError::NotRmc);
    }
    if count < MIN_RMC_FIELDS {
        return Err(NmeaError::FieldCount(count));
    }

    // Anything but an active status counts as no lock.
    let valid = fields[2] == "A";

    let time = parse_time(fields[1])?;
    let latitude = parse_coordinate(fields[3], fields[4], 'N', 'S', "latitude")?;
    let longitude = parse_coordinate(fields[5], fields[6], 'E', 'W', "longitude")?;
    let date = parse_date(fields[9])?;

    if valid && (fields[3].is_empty() || fields[5].is_empty()) {
        return Err(NmeaError::InvalidField("position"));
    }

    Ok(Fix {
        latitude,
        longitude,
        date,
        time,
        valid,
        source: FixSource::Satellite,
    })
}

/// Strip and verify an optional `*hh` suffix, returning the checksummed part.
fn verify_checksum(body: &str) -> Result<&str, NmeaError> {
    let Some((data, checksum)) = body.split_once('*') else {
        return Ok(body);
    };
    if checksum.len() != 2 {
        return Err(NmeaError::BadChecksumField);
    }
    let expected = u8::from_str_radix(checksum, 16).map_err(|_| NmeaError::BadChecksumField)?;
    let computed = data.bytes().fold(0u8, |acc, b| acc ^ b);
    if expected != computed {
        return Err(NmeaError::Checksum { expected, computed });
    }
    Ok(data)
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere. Empty fields decode to zero.
fn parse_coordinate(
    value: &str,
    hemisphere: &str,
    positive: char,
    negative: char,
    name: &'static str,
) -> Result<Coordinate, NmeaError> {
    if value.is_empty() {
        return Ok(Coordinate::ZERO);
    }
    let raw: f64 = value.parse().map_err(|_| NmeaError::InvalidField(name))?;
    if raw < 0.0 {
        return Err(NmeaError::InvalidField(name));
    }
    let degrees = (raw / 100.0).floor();
    let minutes = raw - degrees * 100.0;
    if minutes >= 60.0 {
        return Err(NmeaError::InvalidField(name));
    }
    let mut decimal = degrees + minutes / 60.0;

    let mut chars = hemisphere.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c == positive => {}
        (Some(c), None) if c == negative => decimal = -decimal,
        _ => return Err(NmeaError::InvalidField(name)),
    }

    Coordinate::from_degrees(decimal).ok_or(NmeaError::InvalidField(name))
}

/// `hhmmss[.sss]`. Empty means the receiver has no time yet.
fn parse_time(field: &str) -> Result<Option<NaiveTime>, NmeaError> {
    if field.is_empty() {
        return Ok(None);
    }
    let (whole, fraction) = field.split_once('.').unwrap_or((field, ""));
    if whole.len() != 6 || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NmeaError::InvalidField("time"));
    }
    let hh: u32 = whole[0..2].parse().map_err(|_| NmeaError::InvalidField("time"))?;
    let mm: u32 = whole[2..4].parse().map_err(|_| NmeaError::InvalidField("time"))?;
    let ss: u32 = whole[4..6].parse().map_err(|_| NmeaError::InvalidField("time"))?;

    let mut millis = 0u32;
    let mut scale = 100u32;
    for b in fraction.bytes().take(3) {
        if !b.is_ascii_digit() {
            return Err(NmeaError::InvalidField("time"));
        }
        millis += (b - b'0') as u32 * scale;
        scale /= 10;
    }

    NaiveTime::from_hms_milli_opt(hh, mm, ss, millis)
        .map(Some)
        .ok_or(NmeaError::InvalidField("time"))
}

/// `ddmmyy`. Years below 80 are 20xx, the rest 19xx.
fn parse_date(field: &str) -> Result<Option<NaiveDate>, NmeaError> {
    if field.is_empty() {
        return Ok(None);
    }
    if field.len() != 6 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NmeaError::InvalidField("date"));
    }
    let dd: u32 = field[0..2].parse().map_err(|_| NmeaError::InvalidField("date"))?;
    let mm: u32 = field[2..4].parse().map_err(|_| NmeaError::InvalidField("date"))?;
    let yy: i32 = field[4..6].parse().map_err(|_| NmeaError::InvalidField("date"))?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };

    NaiveDate::from_ymd_opt(year, mm, dd)
        .map(Some)
        .ok_or(NmeaError::InvalidField("date"))
}
