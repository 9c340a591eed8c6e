//! Core rate limiter implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::bucket::{Bucket, BucketContext, BucketGuard};
use super::custom::{CustomRateLimit, CustomRateLimitConfig};
use super::events::RateLimitEvent;
use super::global::GlobalThrottle;
use super::headers::HeaderScheme;
use crate::error::{GateError, Result};

/// Margin added to header-derived reset times to absorb clock skew and latency.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(250);

const EVENT_CAPACITY: usize = 64;

/// How `set_custom_rate_limit` treats buckets already attached to another rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPolicy {
    /// The rule being set always replaces the bucket's current rule
    #[default]
    LastWins,
    /// The earliest registered matching rule is kept, as at bucket creation
    FirstRegistered,
}

/// Settings for constructing a [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Response header names
    pub headers: HeaderScheme,
    /// Added to reset times computed from the reset header
    pub safety_margin: Duration,
    /// Priority between overlapping custom rate limit suffixes
    pub attach_policy: AttachPolicy,
    /// Custom rate limits registered at construction, in order
    pub custom_rate_limits: Vec<CustomRateLimitConfig>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            headers: HeaderScheme::default(),
            safety_margin: DEFAULT_SAFETY_MARGIN,
            attach_policy: AttachPolicy::default(),
            custom_rate_limits: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Registry {
    buckets: HashMap<String, Arc<Bucket>>,
    /// Registration order, first match wins at bucket creation
    rules: Vec<Arc<CustomRateLimit>>,
}

/// The rate limiter that owns every bucket.
///
/// This struct is thread-safe and can be shared across multiple tasks. The
/// registry lock is only held for short, non-blocking sections; waiting for
/// quota happens on the individual bucket so one exhausted key never holds
/// up another.
pub struct RateLimiter {
    registry: Mutex<Registry>,
    global: Arc<GlobalThrottle>,
    context: Arc<BucketContext>,
    attach_policy: AttachPolicy,
}

impl RateLimiter {
    /// Create a new rate limiter with default settings.
    pub fn new() -> Self {
        Self::with_settings(LimiterSettings::default())
    }

    /// Create a rate limiter from explicit settings.
    pub fn with_settings(settings: LimiterSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let limiter = Self {
            registry: Mutex::new(Registry::default()),
            global: Arc::new(GlobalThrottle::new()),
            context: Arc::new(BucketContext {
                headers: settings.headers,
                safety_margin: settings.safety_margin,
                events,
            }),
            attach_policy: settings.attach_policy,
        };

        for rule in &settings.custom_rate_limits {
            limiter.set_custom_rate_limit(&rule.suffix, rule.requests, rule.reset());
        }
        limiter
    }

    /// Define or update a custom rate limit for every key ending in `suffix`.
    ///
    /// An existing rule with the same suffix is updated in place, so buckets
    /// already using it see the new quota. Existing buckets whose key matches
    /// are (re)attached according to the limiter's [`AttachPolicy`].
    pub fn set_custom_rate_limit(&self, suffix: &str, requests: i64, reset: Duration) {
        let mut registry = self.registry.lock();

        let position = match registry.rules.iter().position(|r| r.suffix() == suffix) {
            Some(position) => {
                registry.rules[position].update(requests, reset);
                debug!(suffix, requests, reset_ms = reset.as_millis() as u64, "Updated custom rate limit");
                position
            }
            None => {
                registry
                    .rules
                    .push(Arc::new(CustomRateLimit::new(suffix, requests, reset)));
                debug!(suffix, requests, reset_ms = reset.as_millis() as u64, "Added custom rate limit");
                registry.rules.len() - 1
            }
        };

        let rule = Arc::clone(&registry.rules[position]);
        for bucket in registry.buckets.values() {
            if !rule.matches(bucket.key()) {
                continue;
            }

            let replace = match self.attach_policy {
                AttachPolicy::LastWins => true,
                AttachPolicy::FirstRegistered => match bucket.custom_rate_limit() {
                    None => true,
                    Some(current) => registry
                        .rules
                        .iter()
                        .position(|r| Arc::ptr_eq(r, &current))
                        .map_or(true, |current_position| current_position >= position),
                },
            };

            if replace {
                trace!(key = %bucket.key(), suffix, "Attached custom rate limit");
                bucket.attach(Some(Arc::clone(&rule)));
            }
        }
    }

    /// Remove a custom rate limit and detach it from every bucket using it.
    pub fn remove_custom_rate_limit(&self, suffix: &str) -> Result<()> {
        let mut registry = self.registry.lock();

        let position = registry
            .rules
            .iter()
            .position(|r| r.suffix() == suffix)
            .ok_or_else(|| GateError::NotFound(suffix.to_string()))?;
        registry.rules.remove(position);

        let detached = registry
            .buckets
            .values()
            .filter(|bucket| bucket.detach_suffix(suffix))
            .count();

        debug!(suffix, detached, "Removed custom rate limit");
        Ok(())
    }

    /// Get the bucket for a key, creating it on first use.
    fn resolve_bucket(&self, key: &str) -> Arc<Bucket> {
        let mut registry = self.registry.lock();

        if let Some(bucket) = registry.buckets.get(key) {
            return Arc::clone(bucket);
        }

        let bucket = Arc::new(Bucket::new(
            key,
            Arc::clone(&self.global),
            Arc::clone(&self.context),
        ));

        let rule = registry.rules.iter().find(|r| r.matches(key)).cloned();
        debug!(
            key,
            custom_rate_limit = rule.as_ref().map(|r| r.suffix()),
            "Creating new bucket"
        );
        bucket.attach(rule);

        registry.buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Wait until a request may be sent for `key` and take its admission slot.
    ///
    /// Waits for any request already in flight on the same key, then for the
    /// bucket's reset if its quota is used up, then for the global throttle.
    /// The pending request is counted against the quota before returning.
    /// The returned guard must be released with the outcome of the request.
    pub async fn lock_bucket(&self, key: &str) -> BucketGuard {
        self.resolve_bucket(key).acquire().await
    }

    /// Look up a bucket without creating it.
    pub fn bucket(&self, key: &str) -> Option<Arc<Bucket>> {
        self.registry.lock().buckets.get(key).cloned()
    }

    /// Get the number of buckets created so far.
    pub fn bucket_count(&self) -> usize {
        self.registry.lock().buckets.len()
    }

    /// Snapshot of the custom rate limits, in registration order.
    pub fn custom_rate_limits(&self) -> Vec<CustomRateLimitConfig> {
        self.registry
            .lock()
            .rules
            .iter()
            .map(|r| CustomRateLimitConfig::from(r.as_ref()))
            .collect()
    }

    /// When the global throttle lifts, if it is currently active.
    pub fn global_reset(&self) -> Option<Instant> {
        self.global.get().filter(|until| *until > Instant::now())
    }

    /// Subscribe to notifications about learned retry-after windows.
    pub fn subscribe(&self) -> broadcast::Receiver<RateLimitEvent> {
        self.context.events.subscribe()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
