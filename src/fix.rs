//! Position fix value type.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use snafu::prelude::*;
use std::fmt;

use crate::error::{ColumnCountSnafu, InvalidNumberSnafu, InvalidTimestampSnafu, ParseError};

/// Number of columns in a serialized fix.
pub const FIX_COLUMNS: usize = 5;

/// One timestamped position/speed reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub timestamp: DateTime<Utc>,
    /// Decimal degrees, negative south.
    pub latitude: Option<f64>,
    /// Decimal degrees, negative west.
    pub longitude: Option<f64>,
    /// Meters above mean sea level.
    pub altitude: Option<f64>,
    /// km/h.
    pub speed: Option<f64>,
}

impl Fix {
    /// Serialize to the flat row used by the buffer file.
    pub fn to_record(&self) -> [String; FIX_COLUMNS] {
        [
            self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            format_optional(self.latitude),
            format_optional(self.longitude),
            format_optional(self.altitude),
            format_optional(self.speed),
        ]
    }

    /// Parse a flat row back into a fix.
    ///
    /// Empty fields are absent values. Timestamps may be RFC 3339 or naive
    /// ISO-8601 (`T` or space separated), the latter read as UTC.
    pub fn from_record<S: AsRef<str>>(fields: &[S]) -> Result<Self, ParseError> {
        ensure!(
            fields.len() == FIX_COLUMNS,
            ColumnCountSnafu {
                expected: FIX_COLUMNS,
                found: fields.len(),
            }
        );

        Ok(Self {
            timestamp: parse_timestamp(fields[0].as_ref())?,
            latitude: parse_optional("latitude", fields[1].as_ref())?,
            longitude: parse_optional("longitude", fields[2].as_ref())?,
            altitude: parse_optional("altitude", fields[3].as_ref())?,
            speed: parse_optional("speed", fields[4].as_ref())?,
        })
    }

    /// Return a copy with `speed` replaced.
    pub fn with_speed(self, speed: Option<f64>) -> Self {
        Self { speed, ..self }
    }
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_record().join(","))
    }
}

fn format_optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_optional(field: &'static str, value: &str) -> Result<Option<f64>, ParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<f64>()
        .map(Some)
        .context(InvalidNumberSnafu { field, value })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ParseError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    InvalidTimestampSnafu { value }.fail()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Fix {
        Fix {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            latitude: Some(52.5),
            longitude: Some(13.4),
            altitude: Some(34.0),
            speed: Some(12.3),
        }
    }

    #[test]
    fn test_record_layout() {
        let record = sample().to_record();
        assert_eq!(record[0], "2024-01-01T00:00:00Z");
        assert_eq!(record[1], "52.5");
        assert_eq!(record[3], "34");
        assert_eq!(sample().to_string(), "2024-01-01T00:00:00Z,52.5,13.4,34,12.3");
    }

    #[test]
    fn test_absent_values_are_empty_fields() {
        let fix = Fix {
            latitude: None,
            speed: None,
            ..sample()
        };
        let record = fix.to_record();
        assert_eq!(record[1], "");
        assert_eq!(record[4], "");

        let parsed = Fix::from_record(&record).unwrap();
        assert_eq!(parsed, fix);
    }

    #[test]
    fn test_naive_timestamps_are_utc() {
        let fields = ["2024-01-01 00:00:05.250000", "1", "2", "", ""];
        let fix = Fix::from_record(&fields).unwrap();
        assert_eq!(
            fix.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap() + chrono::Duration::milliseconds(250)
        );

        let fields = ["2024-01-01T00:00:05", "1", "2", "", ""];
        assert!(Fix::from_record(&fields).is_ok());
    }

    #[test]
    fn test_rejects_wrong_column_count() {
        let err = Fix::from_record(&["2024-01-01T00:00:00Z", "1"]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::ColumnCount {
                expected: 5,
                found: 2
            }
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = Fix::from_record(&["yesterday", "1", "2", "3", "4"]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidTimestamp { .. }));

        let err = Fix::from_record(&["2024-01-01T00:00:00Z", "north", "2", "3", "4"]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidNumber {
                field: "latitude",
                ..
            }
        ));
    }
}
