//! The typed point/value model shared by every storage and query module.
//!
//! A [`Point`] pairs a timestamp with a [`Value`]; a series stores exactly one
//! [`Value`] variant for its entire lifetime (§3 of the specification this
//! crate implements).

use serde::{Deserialize, Serialize};

/// Wall-clock precision a database is configured for.
///
/// Only [`Precision::Seconds`] uses a 4-byte on-disk timestamp; all other
/// precisions use 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    /// Seconds since the epoch, stored as `u32`.
    Seconds,
    /// Milliseconds since the epoch, stored as `u64`.
    Millis,
    /// Microseconds since the epoch, stored as `u64`.
    Micros,
    /// Nanoseconds since the epoch, stored as `u64`.
    Nanos,
}

impl Precision {
    /// Returns the on-disk width, in bytes, of a timestamp at this precision.
    #[must_use]
    pub fn timestamp_width(self) -> usize {
        match self {
            Self::Seconds => 4,
            Self::Millis | Self::Micros | Self::Nanos => 8,
        }
    }

    /// Returns whether this precision uses the 32-bit on-disk timestamp form.
    #[must_use]
    pub fn is_32_bit(self) -> bool {
        matches!(self, Self::Seconds)
    }

    /// Largest timestamp representable at this precision.
    #[must_use]
    pub fn max_timestamp(self) -> u64 {
        if self.is_32_bit() {
            u64::from(u32::MAX)
        } else {
            u64::MAX
        }
    }
}

/// The type tag fixed for a series at creation (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesType {
    /// Signed 64-bit integer values.
    Integer,
    /// IEEE-754 double values.
    Float,
    /// Variable-length UTF-8 string values.
    String,
}

impl SeriesType {
    /// Returns whether this type is stored in the in-memory/on-disk point
    /// buffer. String series bypass the buffer entirely (§4.1).
    #[must_use]
    pub fn is_buffered(self) -> bool {
        !matches!(self, Self::String)
    }
}

/// A single typed value. A series holds exactly one variant for its
/// lifetime; mixing variants within a series is a [`crate::error::SeriesError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Signed 64-bit integer.
    Int(i64),
    /// IEEE-754 double.
    Float(f64),
    /// UTF-8 string.
    Str(String),
}

impl Value {
    /// Returns the [`SeriesType`] this value belongs to.
    #[must_use]
    pub fn series_type(&self) -> SeriesType {
        match self {
            Self::Int(_) => SeriesType::Integer,
            Self::Float(_) => SeriesType::Float,
            Self::Str(_) => SeriesType::String,
        }
    }

    /// Returns the integer payload, if this is an [`Value::Int`].
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the float payload, if this is a [`Value::Float`].
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if this is a [`Value::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// A single `(timestamp, value)` sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Timestamp, in the database's configured [`Precision`].
    pub ts: u64,
    /// The value recorded at `ts`.
    pub value: Value,
}

impl Point {
    /// Creates a new point.
    #[must_use]
    pub fn new(ts: u64, value: Value) -> Self {
        Self { ts, value }
    }
}

/// Validates that `ts` is representable at the given precision
/// (`siridb_int64_valid_ts` in spec.md §7).
#[must_use]
pub fn is_valid_ts(ts: u64, precision: Precision) -> bool {
    ts <= precision.max_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_precision_is_32_bit() {
        assert!(Precision::Seconds.is_32_bit());
        assert!(!Precision::Millis.is_32_bit());
        assert_eq!(Precision::Seconds.timestamp_width(), 4);
        assert_eq!(Precision::Nanos.timestamp_width(), 8);
    }

    #[test]
    fn ts_validity_bounds() {
        assert!(is_valid_ts(u64::from(u32::MAX), Precision::Seconds));
        assert!(!is_valid_ts(u64::from(u32::MAX) + 1, Precision::Seconds));
        assert!(is_valid_ts(u64::MAX, Precision::Nanos));
    }

    #[test]
    fn string_series_is_unbuffered() {
        assert!(SeriesType::Integer.is_buffered());
        assert!(SeriesType::Float.is_buffered());
        assert!(!SeriesType::String.is_buffered());
    }
}
