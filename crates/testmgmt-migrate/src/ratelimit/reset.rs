//! Reset-time extraction from 429 responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reset time used when nothing better is known.
pub const DEFAULT_RESET_MS: u64 = 60_000;

/// Integers below this are delta seconds in [`ResetMode::Auto`]; larger ones are epoch seconds.
pub const AUTO_EPOCH_CUTOFF: u64 = 1_000_000_000;

/// How a reset header value is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    /// Small integers are delta seconds, large ones epoch seconds, anything
    /// else is tried as an HTTP date.
    #[default]
    Auto,
    /// Delta seconds (`Retry-After: 30`).
    Seconds,
    /// Absolute Unix timestamp in seconds (`X-RateLimit-Reset: 1735689600`).
    EpochSeconds,
    /// RFC 2822 / HTTP date.
    HttpDate,
}

/// Provider-specific reset extraction, consulted before the header policy.
pub trait ResetExtractor: Send + Sync {
    /// Milliseconds until the provider accepts calls again.
    fn extract(&self, headers: &HashMap<String, String>) -> Option<u64>;
}

impl<F> ResetExtractor for F
where
    F: Fn(&HashMap<String, String>) -> Option<u64> + Send + Sync,
{
    fn extract(&self, headers: &HashMap<String, String>) -> Option<u64> {
        self(headers)
    }
}

/// Case-insensitive header lookup.
pub fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
}

/// Milliseconds from `now` until the reset described by `value`.
pub fn parse_reset(value: &str, mode: ResetMode, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    match mode {
        ResetMode::Seconds => value.parse::<u64>().ok().map(|s| s.saturating_mul(1000)),
        ResetMode::EpochSeconds => value.parse::<i64>().ok().map(|epoch| until_epoch(epoch, now)),
        ResetMode::HttpDate => parse_date(value).map(|at| until(at, now)),
        ResetMode::Auto => match value.parse::<u64>() {
            Ok(n) if n < AUTO_EPOCH_CUTOFF => Some(n.saturating_mul(1000)),
            Ok(n) => Some(until_epoch(n as i64, now)),
            Err(_) => parse_date(value).map(|at| until(at, now)),
        },
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn until_epoch(epoch_secs: i64, now: DateTime<Utc>) -> u64 {
    let remaining = epoch_secs.saturating_sub(now.timestamp());
    (remaining.max(0) as u64).saturating_mul(1000)
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (at - now).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_auto_small_integer_is_seconds() {
        assert_eq!(parse_reset("30", ResetMode::Auto, now()), Some(30_000));
    }

    #[test]
    fn test_auto_large_integer_is_epoch() {
        let at = now().timestamp() + 45;
        assert_eq!(parse_reset(&at.to_string(), ResetMode::Auto, now()), Some(45_000));
    }

    #[test]
    fn test_auto_http_date() {
        assert_eq!(
            parse_reset("Wed, 01 Jan 2025 00:00:10 GMT", ResetMode::Auto, now()),
            Some(10_000)
        );
    }

    #[test]
    fn test_explicit_epoch_mode_handles_small_values() {
        // An explicit mode never reinterprets the value.
        assert_eq!(parse_reset("30", ResetMode::EpochSeconds, now()), Some(0));
        assert_eq!(parse_reset("30", ResetMode::Seconds, now()), Some(30_000));
    }

    #[test]
    fn test_past_reset_is_zero_and_garbage_is_none() {
        assert_eq!(
            parse_reset("Tue, 31 Dec 2024 23:59:00 GMT", ResetMode::HttpDate, now()),
            Some(0)
        );
        assert_eq!(parse_reset("soon", ResetMode::Auto, now()), None);
        assert_eq!(parse_reset("-5", ResetMode::Seconds, now()), None);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let headers = HashMap::from([("retry-after".to_string(), " 12 ".to_string())]);
        assert_eq!(header(&headers, "Retry-After"), Some("12"));
        assert_eq!(header(&headers, "X-RateLimit-Reset"), None);
    }
}
