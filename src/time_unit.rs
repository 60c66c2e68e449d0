//! Duration conversion for timeout-bearing operations.
//!
//! Callers express timeouts as `(value, unit)` pairs. Everything inside the
//! crate works in milliseconds, so the pair is normalized with [`to_millis`].
//! Sub-millisecond units truncate: `1500 µs` is `1 ms`, `500 ns` is `0 ms`.

use crate::error::{HzlinkError, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;
const MICROS_PER_MILLI: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Unit a duration value is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeUnit {
    Days,
    Hours,
    Minutes,
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl TimeUnit {
    /// Upper-case name, as accepted by [`FromStr`] and configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Days => "DAYS",
            TimeUnit::Hours => "HOURS",
            TimeUnit::Minutes => "MINUTES",
            TimeUnit::Seconds => "SECONDS",
            TimeUnit::Milliseconds => "MILLISECONDS",
            TimeUnit::Microseconds => "MICROSECONDS",
            TimeUnit::Nanoseconds => "NANOSECONDS",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = HzlinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAYS" => Ok(TimeUnit::Days),
            "HOURS" => Ok(TimeUnit::Hours),
            "MINUTES" => Ok(TimeUnit::Minutes),
            "SECONDS" => Ok(TimeUnit::Seconds),
            "MILLISECONDS" => Ok(TimeUnit::Milliseconds),
            "MICROSECONDS" => Ok(TimeUnit::Microseconds),
            "NANOSECONDS" => Ok(TimeUnit::Nanoseconds),
            other => Err(HzlinkError::InvalidArgument(format!(
                "Unknown time unit: {}",
                other
            ))),
        }
    }
}

/// A duration magnitude as supplied by a caller.
///
/// Narrow integers, 64-bit integers and decimal strings are all accepted so
/// that values read from configuration or other clients keep their full
/// precision.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Int(i32),
    Wide(i64),
    Text(String),
}

impl TimeValue {
    fn to_i64(&self) -> Result<i64> {
        match self {
            TimeValue::Int(v) => Ok(i64::from(*v)),
            TimeValue::Wide(v) => Ok(*v),
            TimeValue::Text(s) => s.trim().parse::<i64>().map_err(|_| {
                HzlinkError::InvalidArgument(format!("Duration is not an integer: {:?}", s))
            }),
        }
    }
}

impl From<i32> for TimeValue {
    fn from(v: i32) -> Self {
        TimeValue::Int(v)
    }
}

impl From<u32> for TimeValue {
    fn from(v: u32) -> Self {
        TimeValue::Wide(i64::from(v))
    }
}

impl From<i64> for TimeValue {
    fn from(v: i64) -> Self {
        TimeValue::Wide(v)
    }
}

impl From<&str> for TimeValue {
    fn from(v: &str) -> Self {
        TimeValue::Text(v.to_string())
    }
}

impl From<String> for TimeValue {
    fn from(v: String) -> Self {
        TimeValue::Text(v)
    }
}

/// Convert `value` expressed in `unit` to milliseconds.
pub fn to_millis(value: impl Into<TimeValue>, unit: TimeUnit) -> Result<i64> {
    let value = value.into().to_i64()?;
    let scaled = match unit {
        TimeUnit::Days => value.checked_mul(MILLIS_PER_DAY),
        TimeUnit::Hours => value.checked_mul(MILLIS_PER_HOUR),
        TimeUnit::Minutes => value.checked_mul(MILLIS_PER_MINUTE),
        TimeUnit::Seconds => value.checked_mul(MILLIS_PER_SECOND),
        TimeUnit::Milliseconds => Some(value),
        // Integer division truncates toward zero.
        TimeUnit::Microseconds => Some(value / MICROS_PER_MILLI),
        TimeUnit::Nanoseconds => Some(value / NANOS_PER_MILLI),
    };
    scaled.ok_or_else(|| {
        HzlinkError::InvalidArgument(format!(
            "{} {} does not fit in 64-bit milliseconds",
            value, unit
        ))
    })
}

/// Like [`to_millis`], but produces a [`Duration`] for use with timers.
/// Negative durations are rejected.
pub fn to_duration(value: impl Into<TimeValue>, unit: TimeUnit) -> Result<Duration> {
    let millis = to_millis(value, unit)?;
    u64::try_from(millis)
        .map(Duration::from_millis)
        .map_err(|_| HzlinkError::InvalidArgument(format!("Negative duration: {} ms", millis)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coarse_units() {
        assert_eq!(to_millis(1, TimeUnit::Days).unwrap(), 86_400_000);
        assert_eq!(to_millis(1, TimeUnit::Hours).unwrap(), 3_600_000);
        assert_eq!(to_millis(2, TimeUnit::Minutes).unwrap(), 120_000);
        assert_eq!(to_millis(3, TimeUnit::Seconds).unwrap(), 3_000);
        assert_eq!(to_millis(42, TimeUnit::Milliseconds).unwrap(), 42);
    }

    #[test]
    fn test_fine_units_truncate() {
        assert_eq!(to_millis(1500, TimeUnit::Microseconds).unwrap(), 1);
        assert_eq!(to_millis(999, TimeUnit::Microseconds).unwrap(), 0);
        assert_eq!(to_millis(500, TimeUnit::Nanoseconds).unwrap(), 0);
        assert_eq!(to_millis(2_999_999, TimeUnit::Nanoseconds).unwrap(), 2);
    }

    #[test]
    fn test_string_and_wide_values() {
        assert_eq!(to_millis("120", TimeUnit::Seconds).unwrap(), 120_000);
        assert_eq!(
            to_millis(" 9007199254740993 ", TimeUnit::Milliseconds).unwrap(),
            9_007_199_254_740_993
        );
        assert_eq!(
            to_millis(i64::MAX, TimeUnit::Nanoseconds).unwrap(),
            i64::MAX / 1_000_000
        );
        assert_eq!(to_millis(7u32, TimeUnit::Seconds).unwrap(), 7_000);
    }

    #[test]
    fn test_invalid_values() {
        assert!(to_millis("ten", TimeUnit::Seconds).is_err());
        assert!(to_millis(i64::MAX, TimeUnit::Days).is_err());
        assert!(to_duration(-1, TimeUnit::Seconds).is_err());
    }

    #[test]
    fn test_unit_parsing() {
        assert_eq!("seconds".parse::<TimeUnit>().unwrap(), TimeUnit::Seconds);
        assert_eq!("NANOSECONDS".parse::<TimeUnit>().unwrap(), TimeUnit::Nanoseconds);
        assert!("fortnights".parse::<TimeUnit>().is_err());
        assert_eq!(TimeUnit::Minutes.to_string(), "MINUTES");
    }

    #[test]
    fn test_to_duration() {
        assert_eq!(
            to_duration("2", TimeUnit::Seconds).unwrap(),
            Duration::from_millis(2_000)
        );
    }
}
