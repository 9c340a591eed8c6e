//! Account-wide throttle shared by every bucket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// The global throttle instant shared by all buckets of a limiter.
///
/// The instant is stored as a nanosecond offset from a base instant captured
/// at construction, which lets it live in a single atomic. An offset of zero
/// means no global throttle has ever been set.
#[derive(Debug)]
pub struct GlobalThrottle {
    base: Instant,
    until_nanos: AtomicU64,
}

impl GlobalThrottle {
    /// Create an inactive global throttle.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            until_nanos: AtomicU64::new(0),
        }
    }

    /// Hold every bucket until `until`.
    pub fn set(&self, until: Instant) {
        let offset = until.saturating_duration_since(self.base).as_nanos();
        let offset = u64::try_from(offset).unwrap_or(u64::MAX).max(1);
        self.until_nanos.store(offset, Ordering::SeqCst);
    }

    /// The instant the global throttle lifts, if one was ever set.
    pub fn get(&self) -> Option<Instant> {
        match self.until_nanos.load(Ordering::SeqCst) {
            0 => None,
            nanos => Some(self.base + Duration::from_nanos(nanos)),
        }
    }

    /// Whether the throttle is holding admissions right now.
    pub fn is_active(&self) -> bool {
        self.get().is_some_and(|until| until > Instant::now())
    }

    /// Sleep until the global throttle has elapsed.
    ///
    /// Returns the time spent waiting, zero if the throttle was not active.
    pub async fn wait(&self) -> Duration {
        let Some(until) = self.get() else {
            return Duration::ZERO;
        };

        let now = Instant::now();
        if until <= now {
            return Duration::ZERO;
        }

        tokio::time::sleep_until(until).await;
        until - now
    }
}

impl Default for GlobalThrottle {
    fn default() -> Self {
        Self::new()
    }
}
