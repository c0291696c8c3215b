//! Timestamp utilities
//!
//! All timestamps in the system are UTC. Checkpoints and database columns
//! store RFC3339 strings; the profile service reports last-modified times
//! as fixed-point decimal epoch seconds (often a bare digit string where
//! everything past the tenth digit is the fractional part).

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Sentinel used when a checkpoint has never been written.
///
/// Any real update is newer than this, so a missing checkpoint means
/// "process everything".
pub const EPOCH_DEFAULT: &str = "1974-11-09T22:56:52.518001Z";

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp as RFC3339 with microsecond precision
pub fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC3339/ISO8601 timestamp string into UTC
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a fixed-point decimal epoch timestamp.
///
/// Accepts either `"1437080261.216"` or the bare digit form
/// `"1437080261216"` where digits past the tenth are fractional.
pub fn parse_epoch_decimal(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (secs_part, frac_part) = if let Some((s, f)) = value.split_once('.') {
        (s, f)
    } else if value.len() > 10 {
        value.split_at(10)
    } else {
        (value, "")
    };

    let secs: i64 = secs_part.parse().ok()?;
    let nanos: u32 = if frac_part.is_empty() {
        0
    } else {
        if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // scale the fraction to nanoseconds
        let mut padded = frac_part.to_string();
        while padded.len() < 9 {
            padded.push('0');
        }
        padded[..9].parse().ok()?
    };

    Utc.timestamp_opt(secs, nanos).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_default_parses() {
        let ts = parse_rfc3339(EPOCH_DEFAULT).unwrap();
        assert_eq!(ts.timestamp(), 153269812);
    }

    #[test]
    fn test_format_round_trip() {
        let ts = now();
        let parsed = parse_rfc3339(&format_rfc3339(ts)).unwrap();
        assert_eq!(parsed.timestamp_micros(), ts.timestamp_micros());
    }

    #[test]
    fn test_parse_epoch_decimal_with_point() {
        let ts = parse_epoch_decimal("1437080261.216").unwrap();
        assert_eq!(ts.timestamp(), 1437080261);
        assert_eq!(ts.timestamp_subsec_millis(), 216);
    }

    #[test]
    fn test_parse_epoch_decimal_bare_digits() {
        // millisecond epoch reported as one long digit string
        let ts = parse_epoch_decimal("1437080261216").unwrap();
        assert_eq!(ts.timestamp(), 1437080261);
        assert_eq!(ts.timestamp_subsec_millis(), 216);
    }

    #[test]
    fn test_parse_epoch_decimal_seconds_only() {
        let ts = parse_epoch_decimal("1437080261").unwrap();
        assert_eq!(ts.timestamp(), 1437080261);
        assert_eq!(ts.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_parse_epoch_decimal_garbage() {
        assert!(parse_epoch_decimal("").is_none());
        assert!(parse_epoch_decimal("not-a-number").is_none());
        assert!(parse_epoch_decimal("143708.abc").is_none());
    }
}
