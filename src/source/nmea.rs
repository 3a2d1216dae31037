//! NMEA 0183 sentence decoding for the two sentences the logger uses.
//!
//! GGA carries position and altitude, RMC carries speed over ground.
//! Checksums are stripped but not verified.

use snafu::prelude::*;

use crate::error::{InvalidHemisphereSnafu, InvalidNumberSnafu, ParseError, TooFewFieldsSnafu};

/// Knots to km/h.
pub const KNOTS_TO_KMH: f64 = 1.852;

const GGA_MIN_FIELDS: usize = 10;
const RMC_MIN_FIELDS: usize = 8;

/// A decoded sentence.
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    /// GGA fix data.
    Position {
        latitude: Option<f64>,
        longitude: Option<f64>,
        altitude: Option<f64>,
    },
    /// RMC speed over ground in km/h; `None` when the receiver left it blank.
    Speed(Option<f64>),
    /// Any other sentence type.
    Other,
}

/// Decode one trimmed, non-empty line.
pub fn parse_sentence(line: &str) -> Result<Sentence, ParseError> {
    let body = line.split_once('*').map_or(line, |(body, _checksum)| body);
    let fields: Vec<&str> = body.split(',').collect();
    let header = fields[0];

    if header.ends_with("GGA") {
        parse_gga(&fields)
    } else if header.ends_with("RMC") {
        parse_rmc(&fields)
    } else {
        Ok(Sentence::Other)
    }
}

fn parse_gga(fields: &[&str]) -> Result<Sentence, ParseError> {
    ensure!(
        fields.len() >= GGA_MIN_FIELDS,
        TooFewFieldsSnafu {
            sentence: "GGA",
            expected: GGA_MIN_FIELDS,
            found: fields.len(),
        }
    );

    Ok(Sentence::Position {
        latitude: to_decimal_degrees(fields[2], fields[3])?,
        longitude: to_decimal_degrees(fields[4], fields[5])?,
        // A blank or garbled altitude does not invalidate the position.
        altitude: fields[9].trim().parse().ok(),
    })
}

fn parse_rmc(fields: &[&str]) -> Result<Sentence, ParseError> {
    ensure!(
        fields.len() >= RMC_MIN_FIELDS,
        TooFewFieldsSnafu {
            sentence: "RMC",
            expected: RMC_MIN_FIELDS,
            found: fields.len(),
        }
    );

    let raw = fields[7].trim();
    if raw.is_empty() {
        return Ok(Sentence::Speed(None));
    }
    let knots: f64 = raw.parse().context(InvalidNumberSnafu {
        field: "speed",
        value: raw,
    })?;
    Ok(Sentence::Speed(Some(knots * KNOTS_TO_KMH)))
}

/// Convert `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed degrees.
///
/// Returns `None` when either part is blank (no fix yet).
pub fn to_decimal_degrees(raw: &str, hemisphere: &str) -> Result<Option<f64>, ParseError> {
    let (raw, hemisphere) = (raw.trim(), hemisphere.trim());
    if raw.is_empty() || hemisphere.is_empty() {
        return Ok(None);
    }

    let value: f64 = raw.parse().context(InvalidNumberSnafu {
        field: "coordinate",
        value: raw,
    })?;
    let degrees = (value / 100.0).trunc();
    let minutes = value - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        other => InvalidHemisphereSnafu { value: other }.fail(),
    }
}
