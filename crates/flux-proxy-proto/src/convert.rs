//! Conversions between protobuf timestamps and `chrono` types.

use chrono::{DateTime, Utc};
use prost_types::Timestamp;

// --- Timestamp ---

/// Converts a UTC instant into a protobuf `Timestamp`.
#[must_use]
pub fn timestamp_from_datetime(at: &DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: at.timestamp(),
        nanos: i32::try_from(at.timestamp_subsec_nanos()).unwrap_or(0),
    }
}

/// Converts a protobuf `Timestamp` back into a UTC instant.
///
/// Returns `None` for timestamps outside the range `chrono` can represent or
/// with a negative/overflowing nanosecond component.
#[must_use]
pub fn datetime_from_timestamp(ts: &Timestamp) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(ts.nanos).ok()?;
    DateTime::from_timestamp(ts.seconds, nanos)
}
