//! Timestamp helpers.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// Format: `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`
///
/// # Examples
///
/// ```
/// use buildflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_iso8601(&Utc::now())
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Formats a timestamp as ISO 8601 string.
#[must_use]
pub fn format_iso8601(dt: &Timestamp) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Formats a timestamp as the compact `YYYYmmdd-HHMMSS` stamp used in build ids.
#[must_use]
pub fn compact_stamp(dt: &Timestamp) -> String {
    dt.format("%Y%m%d-%H%M%S").to_string()
}

/// Returns the elapsed time between two timestamps, clamped at zero.
#[must_use]
pub fn elapsed_between(start: &Timestamp, end: &Timestamp) -> Duration {
    (*end - *start).to_std().unwrap_or(Duration::ZERO)
}
