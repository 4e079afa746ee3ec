//! Text encoding of the epoch timestamps reported by the controller.
//!
//! The firmware reports every timing field as seconds since the Unix epoch,
//! with `0` meaning the event never happened during the trial. In the ledger,
//! `0` is written as [NULL_TIMESTAMP] and everything else as a local
//! date-time in [TIMESTAMP_FORMAT], the same format used to name assay
//! directories.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::fmt::Display;
use thiserror::Error;

/// Token written in place of the unset epoch `0`.
pub const NULL_TIMESTAMP: &str = "NULL";

/// `chrono` format of every written timestamp, `YYYY-MM-DD-HH-MM-SS`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Errors converting between epochs and their text form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// The epoch cannot be represented as a date-time.
    #[error("epoch {0} is out of range")]
    OutOfRange(i64),

    /// The text is neither the null token nor a date-time in the expected format.
    #[error("'{0}' is not a timestamp of the form YYYY-MM-DD-HH-MM-SS")]
    Malformed(String),

    /// The local date-time does not exist in the time zone (skipped by a
    /// daylight saving change).
    #[error("'{0}' does not exist in the local time zone")]
    Nonexistent(String),
}

/// Formats an epoch in the local time zone, `0` becoming [NULL_TIMESTAMP].
pub fn to_sentinel_string(epoch: i64) -> Result<String, TimestampError> {
    to_sentinel_string_in(epoch, &Local)
}

/// Parses the output of [to_sentinel_string] back into an epoch.
pub fn from_sentinel_string(text: &str) -> Result<i64, TimestampError> {
    from_sentinel_string_in(text, &Local)
}

/// [to_sentinel_string] for an explicit time zone.
pub fn to_sentinel_string_in<Tz>(epoch: i64, tz: &Tz) -> Result<String, TimestampError>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if epoch == 0 {
        return Ok(NULL_TIMESTAMP.to_owned());
    }
    format_epoch(epoch, tz)
}

fn format_epoch<Tz>(epoch: i64, tz: &Tz) -> Result<String, TimestampError>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let utc = DateTime::from_timestamp(epoch, 0).ok_or(TimestampError::OutOfRange(epoch))?;
    Ok(utc.with_timezone(tz).format(TIMESTAMP_FORMAT).to_string())
}

/// [from_sentinel_string] for an explicit time zone.
///
/// Local times repeated by a daylight saving change resolve to their earlier
/// instant.
pub fn from_sentinel_string_in<Tz: TimeZone>(text: &str, tz: &Tz) -> Result<i64, TimestampError> {
    if text == NULL_TIMESTAMP {
        return Ok(0);
    }
    let naive = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map_err(|_| TimestampError::Malformed(text.to_owned()))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| TimestampError::Nonexistent(text.to_owned()))
}

/// Current time as whole epoch seconds, the unit the controller clock uses.
pub fn now_epoch() -> i64 {
    Local::now().timestamp()
}

/// Name of a directory created at `epoch`, in local time. Unlike
/// [to_sentinel_string], `0` is formatted as a real time.
pub fn directory_name(epoch: i64) -> Result<String, TimestampError> {
    format_epoch(epoch, &Local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn zero_is_null() {
        assert_eq!(to_sentinel_string(0).unwrap(), "NULL");
        assert_eq!(from_sentinel_string("NULL").unwrap(), 0);
    }

    #[test]
    fn formats_in_utc() {
        assert_eq!(
            to_sentinel_string_in(1_690_000_000, &Utc).unwrap(),
            "2023-07-22-04-26-40"
        );
    }

    #[test]
    fn round_trips_in_fixed_offsets() {
        let zones = [
            FixedOffset::east_opt(0).unwrap(),
            FixedOffset::west_opt(7 * 3600).unwrap(),
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap(),
        ];
        for tz in zones {
            for epoch in [1, 59, 1_690_000_000, 1_700_000_123, 2_000_000_000] {
                let text = to_sentinel_string_in(epoch, &tz).unwrap();
                assert_eq!(from_sentinel_string_in(&text, &tz).unwrap(), epoch);
            }
        }
    }

    #[test]
    fn round_trips_in_local_time() {
        for epoch in [1_690_000_000, 1_705_000_000] {
            let text = to_sentinel_string(epoch).unwrap();
            assert_eq!(from_sentinel_string(&text).unwrap(), epoch);
        }
    }

    #[test]
    fn rejects_other_formats() {
        assert!(matches!(
            from_sentinel_string("2023-07-22 04:26:40"),
            Err(TimestampError::Malformed(_))
        ));
        assert!(matches!(
            from_sentinel_string("null"),
            Err(TimestampError::Malformed(_))
        ));
        assert!(matches!(
            from_sentinel_string(""),
            Err(TimestampError::Malformed(_))
        ));
    }

    #[test]
    fn directory_names_use_the_timestamp_format() {
        let name = directory_name(1_690_000_000).unwrap();
        assert_eq!(name.len(), "YYYY-MM-DD-HH-MM-SS".len());
        assert_eq!(name.matches('-').count(), 5);
        assert_eq!(Some(name), to_sentinel_string(1_690_000_000).ok());
        assert_ne!(directory_name(0).unwrap(), NULL_TIMESTAMP);
    }
}
