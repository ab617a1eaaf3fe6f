//! Time utility functions

use chrono::{DateTime, Utc};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Convert milliseconds since Unix epoch to DateTime<Utc>
pub fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(|| {
            tracing::warn!(millis, "Invalid timestamp, using epoch");
            DateTime::UNIX_EPOCH
        })
}

/// Convert milliseconds since Unix epoch to ISO 8601 string (millisecond precision)
pub fn millis_to_iso(millis: u64) -> String {
    millis_to_datetime(millis).to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_millis_to_datetime_epoch() {
        let dt = millis_to_datetime(0);
        assert_eq!(dt.year(), 1970);
        assert_eq!(dt.month(), 1);
        assert_eq!(dt.day(), 1);
    }

    #[test]
    fn test_millis_to_datetime_known_value() {
        // 2024-01-01 00:00:00 UTC = 1704067200 seconds
        let dt = millis_to_datetime(1_704_067_200_000);
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month(), 1);
        assert_eq!(dt.day(), 1);
    }

    #[test]
    fn test_millis_to_datetime_out_of_range() {
        assert_eq!(millis_to_datetime(u64::MAX), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_millis_to_iso() {
        assert_eq!(millis_to_iso(1_500), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn test_now_ms_is_recent() {
        // Anything after 2024-01-01 is plausible for a running system
        assert!(now_ms() > 1_704_067_200_000);
    }
}
