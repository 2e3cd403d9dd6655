//! Apple-epoch timestamp handling.
//!
//! The Messages store timestamps as nanoseconds (or, on older schema
//! versions, seconds) since 2001-01-01T00:00:00Z rather than the Unix epoch.

use chrono::{DateTime, Utc};

/// Seconds between the Unix epoch (1970-01-01) and the Apple epoch (2001-01-01).
pub const APPLE_EPOCH_OFFSET_SECONDS: i64 = 978_307_200;

/// Convert an Apple-epoch nanosecond timestamp to Unix-epoch nanoseconds.
///
/// Preserves nanosecond precision; the offset is applied in seconds then
/// re-added in nanoseconds so no precision is lost to intermediate rounding.
pub fn apple_ns_to_unix_ns(apple_ns: i64) -> i64 {
    apple_ns + APPLE_EPOCH_OFFSET_SECONDS * 1_000_000_000
}

/// Convert Unix-epoch nanoseconds back to Apple-epoch nanoseconds.
pub fn unix_ns_to_apple_ns(unix_ns: i64) -> i64 {
    unix_ns - APPLE_EPOCH_OFFSET_SECONDS * 1_000_000_000
}

/// Convert an Apple-epoch nanosecond timestamp to a UTC `DateTime`.
///
/// Returns `None` if the resulting Unix timestamp is out of chrono's
/// representable range (practically never, for real message data).
pub fn apple_ns_to_datetime(apple_ns: i64) -> Option<DateTime<Utc>> {
    let unix_ns = apple_ns_to_unix_ns(apple_ns);
    DateTime::from_timestamp(
        unix_ns.div_euclid(1_000_000_000),
        unix_ns.rem_euclid(1_000_000_000) as u32,
    )
}

/// Current time as Unix-epoch nanoseconds.
pub fn now_unix_ns() -> i64 {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp() * 1_000_000_000)
}

/// Current time as Unix-epoch seconds (used by the queue, which only needs
/// second resolution for lease/backoff scheduling).
pub fn now_unix_secs() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_apple_epoch() {
        let unix_ns = 1_700_000_000_123_456_789_i64;
        let apple_ns = unix_ns_to_apple_ns(unix_ns);
        assert_eq!(apple_ns_to_unix_ns(apple_ns), unix_ns);
    }

    #[test]
    fn epoch_zero_is_2001() {
        let dt = apple_ns_to_datetime(0).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2001-01-01");
    }

    #[test]
    fn preserves_nanosecond_precision() {
        // 123,456,789 ns past some Apple-epoch second boundary.
        let apple_ns = 500_000_000_000_000_123;
        let dt = apple_ns_to_datetime(apple_ns).unwrap();
        assert_eq!(dt.timestamp_subsec_nanos(), 123);
    }
}
