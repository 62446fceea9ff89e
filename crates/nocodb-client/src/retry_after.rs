//! Retry-After header parsing.
//!
//! Supports both formats per RFC 7231:
//! - Seconds: "120" -> 120
//! - HTTP-date: "Fri, 31 Dec 2024 23:59:59 GMT" -> seconds until that time
//!
//! Parsing never fails. Anything unusable falls back to the caller's default.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Wait used when a 429 carries no usable Retry-After header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Parse a Retry-After value into whole seconds.
///
/// Tries delta-seconds first, then an HTTP-date (a date without a zone is
/// taken as UTC). Dates in the past yield 0. Absent or unparseable values
/// yield `default_secs`.
pub fn parse_retry_after(raw: Option<&str>, default_secs: u64) -> u64 {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return default_secs;
    };

    // Delta-seconds (most common)
    if let Ok(seconds) = raw.parse::<u64>() {
        return seconds;
    }

    if let Some(date) = parse_http_date(raw) {
        let now = Utc::now();
        return (date - now).num_seconds().max(0) as u64;
    }

    tracing::warn!(
        retry_after = %raw,
        default_secs,
        "Could not parse Retry-After header, using default"
    );
    default_secs
}

/// Parse the HTTP-date forms a server may send.
fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    // IMF-fixdate, RFC 850 and asctime, all GMT
    if let Ok(time) = httpdate::parse_http_date(raw) {
        return Some(DateTime::<Utc>::from(time));
    }

    // RFC 2822 with a numeric zone, e.g. "Tue, 1 Jul 2025 10:00:00 +0200"
    if let Ok(date) = DateTime::parse_from_rfc2822(raw) {
        return Some(date.with_timezone(&Utc));
    }

    // Zone omitted entirely: treat as UTC
    NaiveDateTime::parse_from_str(raw, "%a, %d %b %Y %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after(Some("120"), 60), 120);
    }

    #[test]
    fn test_parse_retry_after_zero() {
        assert_eq!(parse_retry_after(Some("0"), 60), 0);
    }

    #[test]
    fn test_parse_retry_after_missing() {
        assert_eq!(parse_retry_after(None, DEFAULT_RETRY_AFTER_SECS), 60);
    }

    #[test]
    fn test_parse_retry_after_empty_value() {
        assert_eq!(parse_retry_after(Some(""), 60), 60);
        assert_eq!(parse_retry_after(Some("   "), 60), 60);
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        assert_eq!(parse_retry_after(Some("not-a-number"), 60), 60);
        // Negative delta-seconds are not valid either
        assert_eq!(parse_retry_after(Some("-5"), 45), 45);
    }

    #[test]
    fn test_parse_retry_after_past_date_clamps_to_zero() {
        assert_eq!(
            parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT"), 60),
            0
        );
    }

    #[test]
    fn test_parse_retry_after_future_date() {
        let future = Utc::now() + ChronoDuration::seconds(90);
        let header = future.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let seconds = parse_retry_after(Some(&header), 60);
        // Sub-second truncation of the formatted date can cost up to a second
        assert!((88..=90).contains(&seconds), "got {seconds}");
    }

    #[test]
    fn test_parse_retry_after_numeric_zone() {
        let future = Utc::now() + ChronoDuration::seconds(300);
        let header = future
            .with_timezone(&chrono::FixedOffset::east_opt(2 * 3600).unwrap())
            .format("%a, %d %b %Y %H:%M:%S %z")
            .to_string();

        let seconds = parse_retry_after(Some(&header), 60);
        assert!((298..=300).contains(&seconds), "got {seconds}");
    }

    #[test]
    fn test_parse_retry_after_missing_zone_is_utc() {
        let future = Utc::now() + ChronoDuration::seconds(120);
        let header = future.format("%a, %d %b %Y %H:%M:%S").to_string();

        let seconds = parse_retry_after(Some(&header), 60);
        assert!((118..=120).contains(&seconds), "got {seconds}");
    }
}
