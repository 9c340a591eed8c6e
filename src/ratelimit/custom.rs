//! Statically configured rate limits for routes without quota headers.

use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

/// Quota granted per cycle by a custom rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Requests allowed per cycle
    pub requests: i64,
    /// Length of a cycle
    pub reset: Duration,
}

/// A custom rate limit matched against bucket keys by suffix.
///
/// Buckets hold this behind an `Arc`, so updating the quota in place is
/// observed by every attached bucket on its next release.
#[derive(Debug)]
pub struct CustomRateLimit {
    suffix: String,
    quota: RwLock<Quota>,
}

impl CustomRateLimit {
    /// Create a new custom rate limit.
    pub fn new(suffix: impl Into<String>, requests: i64, reset: Duration) -> Self {
        Self {
            suffix: suffix.into(),
            quota: RwLock::new(Quota { requests, reset }),
        }
    }

    /// The key suffix this limit applies to.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn requests(&self) -> i64 {
        self.quota.read().requests
    }

    pub fn reset(&self) -> Duration {
        self.quota.read().reset
    }

    /// Read requests and reset together.
    pub fn quota(&self) -> Quota {
        *self.quota.read()
    }

    /// Replace the quota in place.
    pub fn update(&self, requests: i64, reset: Duration) {
        *self.quota.write() = Quota { requests, reset };
    }

    /// Whether a bucket key falls under this limit.
    pub fn matches(&self, key: &str) -> bool {
        key.ends_with(&self.suffix)
    }
}

/// Serializable form of a custom rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRateLimitConfig {
    /// Suffix of the bucket keys this limit applies to
    pub suffix: String,
    /// Requests allowed per cycle
    pub requests: i64,
    /// Cycle length in milliseconds
    pub reset_ms: u64,
}

impl CustomRateLimitConfig {
    pub fn reset(&self) -> Duration {
        Duration::from_millis(self.reset_ms)
    }

    /// Reject rules that could never admit a request.
    pub fn validate(&self) -> Result<()> {
        if self.suffix.is_empty() {
            return Err(GateError::Config(
                "custom rate limit suffix must not be empty".to_string(),
            ));
        }
        if self.requests < 1 {
            return Err(GateError::Config(format!(
                "custom rate limit {:?} must allow at least one request, got {}",
                self.suffix, self.requests
            )));
        }
        if self.reset_ms == 0 {
            return Err(GateError::Config(format!(
                "custom rate limit {:?} must have a non-zero reset",
                self.suffix
            )));
        }
        Ok(())
    }
}

impl From<&CustomRateLimit> for CustomRateLimitConfig {
    fn from(limit: &CustomRateLimit) -> Self {
        let quota = limit.quota();
        Self {
            suffix: limit.suffix.clone(),
            requests: quota.requests,
            reset_ms: u64::try_from(quota.reset.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
