//! Rate limit response header names and value parsing.

use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

/// Names of the response headers a bucket learns from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderScheme {
    /// Requests left in the current window
    #[serde(default = "default_remaining")]
    pub remaining: String,

    /// Epoch seconds at which the window resets
    #[serde(default = "default_reset")]
    pub reset: String,

    /// Present when a retry-after applies to the whole account
    #[serde(default = "default_global")]
    pub global: String,

    /// Milliseconds to wait before retrying
    #[serde(default = "default_retry_after")]
    pub retry_after: String,

    /// Server time the response was generated
    #[serde(default = "default_date")]
    pub date: String,
}

impl Default for HeaderScheme {
    fn default() -> Self {
        Self {
            remaining: default_remaining(),
            reset: default_reset(),
            global: default_global(),
            retry_after: default_retry_after(),
            date: default_date(),
        }
    }
}

fn default_remaining() -> String {
    "X-RateLimit-Remaining".to_string()
}

fn default_reset() -> String {
    "X-RateLimit-Reset".to_string()
}

fn default_global() -> String {
    "X-RateLimit-Global".to_string()
}

fn default_retry_after() -> String {
    "Retry-After".to_string()
}

fn default_date() -> String {
    "Date".to_string()
}

/// Read a header as text, treating an empty value as absent.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };

    let value = value
        .to_str()
        .map_err(|e| GateError::header_parse(name, String::from_utf8_lossy(value.as_bytes()), e))?
        .trim();

    Ok((!value.is_empty()).then_some(value))
}

/// Parse an integer request count.
pub(crate) fn parse_remaining(name: &str, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| GateError::header_parse(name, value, e))
}

/// Parse a retry-after given in whole milliseconds.
pub(crate) fn parse_retry_after(name: &str, value: &str) -> Result<Duration> {
    let millis = value
        .parse::<i64>()
        .map_err(|e| GateError::header_parse(name, value, e))?;

    Ok(Duration::from_millis(millis.max(0) as u64))
}

/// Parse a reset instant given in (possibly fractional) epoch seconds.
pub(crate) fn parse_reset_epoch(name: &str, value: &str) -> Result<f64> {
    let secs = value
        .parse::<f64>()
        .map_err(|e| GateError::header_parse(name, value, e))?;

    if !secs.is_finite() {
        return Err(GateError::header_parse(name, value, "not a finite number"));
    }
    Ok(secs)
}

/// Parse an HTTP-date such as `Wed, 21 Oct 2015 07:28:00 GMT`.
pub(crate) fn parse_http_date(name: &str, value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(value).map_err(|e| GateError::header_parse(name, value, e))
}

/// Time from the response's own clock until the window resets, plus margin.
///
/// Measuring against the response `Date` instead of the local clock removes
/// local clock skew from the calculation. A reset already in the past yields
/// the margin minus the overshoot, floored at zero. A reset too far out to
/// represent as a `Duration` is rejected.
pub(crate) fn reset_delay(
    name: &str,
    value: &str,
    reset_epoch: f64,
    response_date: DateTime<FixedOffset>,
    margin: Duration,
) -> Result<Duration> {
    let date_secs =
        response_date.timestamp() as f64 + f64::from(response_date.timestamp_subsec_nanos()) / 1e9;
    let total = reset_epoch - date_secs + margin.as_secs_f64();

    if total > 0.0 {
        Duration::try_from_secs_f64(total).map_err(|e| GateError::header_parse(name, value, e))
    } else {
        Ok(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_default_scheme_names() {
        let scheme = HeaderScheme::default();
        assert_eq!(scheme.remaining, "X-RateLimit-Remaining");
        assert_eq!(scheme.reset, "X-RateLimit-Reset");
        assert_eq!(scheme.global, "X-RateLimit-Global");
        assert_eq!(scheme.retry_after, "Retry-After");
        assert_eq!(scheme.date, "Date");
    }

    #[test]
    fn test_scheme_partial_yaml_uses_defaults() {
        let scheme: HeaderScheme = serde_yaml::from_str("remaining: X-Quota-Left\n").unwrap();
        assert_eq!(scheme.remaining, "X-Quota-Left");
        assert_eq!(scheme.retry_after, "Retry-After");
    }

    #[test]
    fn test_header_str_is_case_insensitive_and_skips_empty() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4"));
        headers.insert("retry-after", HeaderValue::from_static(""));

        assert_eq!(
            header_str(&headers, "X-RateLimit-Remaining").unwrap(),
            Some("4")
        );
        assert_eq!(header_str(&headers, "Retry-After").unwrap(), None);
        assert_eq!(header_str(&headers, "X-RateLimit-Reset").unwrap(), None);
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_remaining("r", "5").unwrap(), 5);
        assert!(matches!(
            parse_remaining("r", "five"),
            Err(GateError::HeaderParse { .. })
        ));

        assert_eq!(
            parse_retry_after("ra", "2000").unwrap(),
            Duration::from_millis(2000)
        );
        assert!(parse_retry_after("ra", "2.5").is_err());

        assert_eq!(parse_reset_epoch("reset", "1470173023.123").unwrap(), 1470173023.123);
        assert!(parse_reset_epoch("reset", "NaN").is_err());
        assert!(parse_reset_epoch("reset", "soon").is_err());
    }

    #[test]
    fn test_reset_delay_uses_response_date() {
        let date = parse_http_date("Date", "Tue, 02 Aug 2016 21:23:40 GMT").unwrap();
        let reset = date.timestamp() as f64 + 3.0;

        let delay = reset_delay("reset", "", reset, date, Duration::from_millis(250)).unwrap();
        assert_eq!(delay.as_millis(), 3250);
    }

    #[test]
    fn test_reset_delay_in_past_floors_at_zero() {
        let date = parse_http_date("Date", "Tue, 02 Aug 2016 21:23:40 GMT").unwrap();
        let reset = date.timestamp() as f64 - 10.0;

        assert_eq!(
            reset_delay("reset", "", reset, date, Duration::from_millis(250)).unwrap(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_reset_delay_out_of_range_is_parse_error() {
        let date = parse_http_date("Date", "Tue, 02 Aug 2016 21:23:40 GMT").unwrap();
        let reset = parse_reset_epoch("X-RateLimit-Reset", "1e20").unwrap();

        assert!(matches!(
            reset_delay("X-RateLimit-Reset", "1e20", reset, date, Duration::from_millis(250)),
            Err(GateError::HeaderParse { header, .. }) if header == "X-RateLimit-Reset"
        ));
    }

    #[test]
    fn test_parse_http_date_rejects_garbage() {
        assert!(matches!(
            parse_http_date("Date", "yesterday"),
            Err(GateError::HeaderParse { .. })
        ));
    }
}
