//! Per-key admission gate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::custom::CustomRateLimit;
use super::events::RateLimitEvent;
use super::global::GlobalThrottle;
use super::headers::{
    header_str, parse_http_date, parse_remaining, parse_reset_epoch, parse_retry_after,
    reset_delay, HeaderScheme,
};
use crate::error::{GateError, Result};

/// Stand-in for a custom rate limit reset too long to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Settings every bucket of a limiter shares when learning from responses.
#[derive(Debug)]
pub(crate) struct BucketContext {
    pub(crate) headers: HeaderScheme,
    pub(crate) safety_margin: Duration,
    pub(crate) events: broadcast::Sender<RateLimitEvent>,
}

/// Quota state, only reachable while holding the admission slot.
#[derive(Debug)]
struct BucketState {
    remaining: i64,
    reset: Option<Instant>,
    last_reset: Option<Instant>,
}

impl Default for BucketState {
    fn default() -> Self {
        Self {
            remaining: 1,
            reset: None,
            last_reset: None,
        }
    }
}

/// A rate limit bucket for one key.
///
/// The quota state sits behind an async mutex that doubles as the admission
/// slot: at most one request per key is in flight between
/// [`RateLimiter::lock_bucket`](super::RateLimiter::lock_bucket) and
/// [`BucketGuard::release`]. The attached custom rate limit has its own lock
/// so configuration changes never wait on in-flight requests.
pub struct Bucket {
    key: String,
    state: Arc<Mutex<BucketState>>,
    custom: parking_lot::Mutex<Option<Arc<CustomRateLimit>>>,
    global: Arc<GlobalThrottle>,
    context: Arc<BucketContext>,
}

impl Bucket {
    pub(crate) fn new(
        key: impl Into<String>,
        global: Arc<GlobalThrottle>,
        context: Arc<BucketContext>,
    ) -> Self {
        Self {
            key: key.into(),
            state: Arc::new(Mutex::new(BucketState::default())),
            custom: parking_lot::Mutex::new(None),
            global,
            context,
        }
    }

    /// The key this bucket was created for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The custom rate limit currently attached, if any.
    pub fn custom_rate_limit(&self) -> Option<Arc<CustomRateLimit>> {
        self.custom.lock().clone()
    }

    pub(crate) fn attach(&self, limit: Option<Arc<CustomRateLimit>>) {
        *self.custom.lock() = limit;
    }

    /// Detach the custom rate limit if it has exactly this suffix.
    pub(crate) fn detach_suffix(&self, suffix: &str) -> bool {
        let mut custom = self.custom.lock();
        if custom.as_ref().is_some_and(|limit| limit.suffix() == suffix) {
            *custom = None;
            true
        } else {
            false
        }
    }

    /// Take the admission slot, waiting out the bucket reset and the global
    /// throttle, then count the pending request against the quota.
    ///
    /// Dropping the returned future before it completes gives the slot back
    /// without touching the quota.
    pub(crate) async fn acquire(self: Arc<Self>) -> BucketGuard {
        let mut state = self.state.clone().lock_owned().await;

        if state.remaining < 1 {
            if let Some(reset) = state.reset {
                let now = Instant::now();
                if reset > now {
                    debug!(
                        key = %self.key,
                        wait_ms = (reset - now).as_millis() as u64,
                        "Bucket exhausted, waiting for reset"
                    );
                    tokio::time::sleep_until(reset).await;
                }
            }
        }

        if self.global.is_active() {
            debug!(key = %self.key, "Waiting for global rate limit");
        }
        let waited = self.global.wait().await;
        if !waited.is_zero() {
            trace!(
                key = %self.key,
                waited_ms = waited.as_millis() as u64,
                "Global rate limit lifted"
            );
        }

        state.remaining -= 1;
        trace!(key = %self.key, remaining = state.remaining, "Bucket admitted request");

        BucketGuard {
            bucket: self,
            state,
        }
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("key", &self.key)
            .field("custom", &self.custom.lock().as_ref().map(|c| c.suffix().to_string()))
            .finish_non_exhaustive()
    }
}

/// Exclusive admission slot for one in-flight request on a bucket.
///
/// Call [`release`](BucketGuard::release) once the request has completed.
/// Dropping the guard without releasing frees the slot and learns nothing,
/// the same as `release(None)` on a bucket without a custom rate limit.
pub struct BucketGuard {
    bucket: Arc<Bucket>,
    state: OwnedMutexGuard<BucketState>,
}

impl BucketGuard {
    pub fn key(&self) -> &str {
        self.bucket.key()
    }

    /// Requests left, already counting the one this guard admitted.
    pub fn remaining(&self) -> i64 {
        self.state.remaining
    }

    /// When the bucket's quota replenishes, if known.
    pub fn reset(&self) -> Option<Instant> {
        self.state.reset
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    /// Update the bucket from the outcome of the request and free the slot.
    ///
    /// With a custom rate limit attached the headers are ignored. Otherwise
    /// `None` (no response was received) leaves the bucket unchanged. A
    /// malformed header value is returned as an error; fields learned before
    /// it keep their new values and the slot is freed either way.
    pub fn release(mut self, headers: Option<&HeaderMap>) -> Result<()> {
        let now = Instant::now();

        if let Some(limit) = self.bucket.custom_rate_limit() {
            self.apply_custom(&limit, now);
            return Ok(());
        }

        match headers {
            Some(headers) => self.apply_headers(headers, now),
            None => {
                trace!(key = %self.bucket.key, "Released without response");
                Ok(())
            }
        }
    }

    fn apply_custom(&mut self, limit: &CustomRateLimit, now: Instant) {
        let quota = limit.quota();

        let cycle_over = self
            .state
            .last_reset
            .map_or(true, |last| now.saturating_duration_since(last) >= quota.reset);

        if cycle_over {
            self.state.remaining = quota.requests - 1;
            self.state.last_reset = Some(now);
        }
        if self.state.remaining < 1 {
            let reset = now
                .checked_add(quota.reset)
                .unwrap_or_else(|| now + FAR_FUTURE);
            self.state.reset = Some(reset);
        }

        trace!(
            key = %self.bucket.key,
            suffix = %limit.suffix(),
            remaining = self.state.remaining,
            "Released under custom rate limit"
        );
    }

    fn apply_headers(&mut self, headers: &HeaderMap, now: Instant) -> Result<()> {
        let context = Arc::clone(&self.bucket.context);
        let scheme = &context.headers;

        if let Some(value) = header_str(headers, &scheme.retry_after)? {
            let retry_after = parse_retry_after(&scheme.retry_after, value)?;
            let reset_at = now.checked_add(retry_after).ok_or_else(|| {
                GateError::header_parse(&scheme.retry_after, value, "retry-after out of range")
            })?;
            let global = is_global(header_str(headers, &scheme.global)?);

            if global {
                warn!(
                    key = %self.bucket.key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Global rate limit hit, holding all buckets"
                );
                self.bucket.global.set(reset_at);
            } else {
                debug!(
                    key = %self.bucket.key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Bucket rate limited"
                );
                self.state.reset = Some(reset_at);
            }

            // No subscribers is fine
            let _ = context.events.send(RateLimitEvent {
                key: self.bucket.key.clone(),
                retry_after,
                global,
            });
        } else if let Some(value) = header_str(headers, &scheme.reset)? {
            if let Some(date) = header_str(headers, &scheme.date)? {
                let date = parse_http_date(&scheme.date, date)?;
                let reset_epoch = parse_reset_epoch(&scheme.reset, value)?;
                let delay =
                    reset_delay(&scheme.reset, value, reset_epoch, date, context.safety_margin)?;
                let reset_at = now.checked_add(delay).ok_or_else(|| {
                    GateError::header_parse(&scheme.reset, value, "reset out of range")
                })?;
                self.state.reset = Some(reset_at);
            } else {
                trace!(key = %self.bucket.key, "Reset header without Date, ignoring");
            }
        }

        if let Some(value) = header_str(headers, &scheme.remaining)? {
            self.state.remaining = parse_remaining(&scheme.remaining, value)?;
        }

        trace!(
            key = %self.bucket.key,
            remaining = self.state.remaining,
            "Released with response headers"
        );
        Ok(())
    }
}

impl fmt::Debug for BucketGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketGuard")
            .field("key", &self.bucket.key)
            .field("remaining", &self.state.remaining)
            .field("reset", &self.state.reset)
            .finish()
    }
}

/// The global flag counts when present, unless it explicitly says false.
fn is_global(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.eq_ignore_ascii_case("false") && v != "0")
}
