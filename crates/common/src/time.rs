use chrono::{DateTime, Duration, Utc};

/// Current wall-clock time in UTC.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds since the Unix epoch for `at`.
#[must_use]
pub fn unix_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// `start + seconds`, saturating at the far future instead of overflowing.
#[must_use]
pub fn add_secs(start: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    let secs = i64::try_from(seconds).unwrap_or(i64::MAX);
    Duration::try_seconds(secs)
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Parse an RFC 3339 timestamp, returning `None` for malformed input.
#[must_use]
pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
