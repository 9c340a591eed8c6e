//! Rate limit notifications.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Body of a `429 Too Many Requests` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TooManyRequests {
    /// Server-side bucket identifier, if reported
    #[serde(default)]
    pub bucket: Option<String>,
    /// Human readable explanation
    #[serde(default)]
    pub message: String,
    /// Seconds to wait before retrying
    pub retry_after: f64,
    /// Whether the limit applies to the whole account
    #[serde(default)]
    pub global: bool,
}

impl TooManyRequests {
    /// Parse a 429 response body.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// The retry-after as a duration, negative values treated as zero and
    /// values too large for a `Duration` saturated.
    pub fn retry_after_duration(&self) -> Duration {
        if self.retry_after.is_finite() && self.retry_after > 0.0 {
            Duration::try_from_secs_f64(self.retry_after).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

/// Published whenever a bucket learns a retry-after from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEvent {
    /// Key of the bucket that received the response
    pub key: String,
    /// How long requests are held
    pub retry_after: Duration,
    /// Whether every bucket is held rather than just this one
    pub global: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GateError;

    #[test]
    fn test_parse_too_many_requests() {
        let body = br#"{"message": "You are being rate limited.", "retry_after": 0.75, "global": true}"#;
        let parsed = TooManyRequests::from_json(body).unwrap();

        assert_eq!(parsed.message, "You are being rate limited.");
        assert!(parsed.global);
        assert!(parsed.bucket.is_none());
        assert_eq!(parsed.retry_after_duration(), Duration::from_millis(750));
    }

    #[test]
    fn test_parse_minimal_body() {
        let parsed = TooManyRequests::from_json(br#"{"retry_after": 2}"#).unwrap();
        assert!(!parsed.global);
        assert_eq!(parsed.retry_after_duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_huge_retry_after_saturates() {
        let parsed = TooManyRequests::from_json(br#"{"retry_after": 1e30}"#).unwrap();
        assert_eq!(parsed.retry_after_duration(), Duration::MAX);

        let parsed = TooManyRequests::from_json(br#"{"retry_after": -3}"#).unwrap();
        assert_eq!(parsed.retry_after_duration(), Duration::ZERO);
    }

    #[test]
    fn test_parse_invalid_body() {
        assert!(matches!(
            TooManyRequests::from_json(b"<html>slow down</html>"),
            Err(GateError::Body(_))
        ));
    }
}
