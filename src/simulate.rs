//! Load simulation against an in-process rate limited endpoint.
//!
//! The fake endpoint enforces a fixed-window quota per bucket key and answers
//! with the same headers a real API would, including `429` responses with a
//! JSON body. Driving it through a [`RateLimiter`] shows how well the limiter
//! keeps requests inside the server's quota.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SimulationConfig;
use crate::error::{GateError, Result};
use crate::ratelimit::{HeaderScheme, RateLimitEvent, RateLimiter, TooManyRequests};

/// A response from the fake endpoint.
#[derive(Debug, Clone)]
pub struct FakeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

struct Window {
    start: Instant,
    used: i64,
}

/// Fixed-window quota enforcement, one window per key.
pub struct FakeServer {
    quota: i64,
    window: Duration,
    global: bool,
    headers: HeaderScheme,
    windows: Mutex<HashMap<String, Window>>,
}

impl FakeServer {
    /// Create a server allowing `quota` requests per key every `window`.
    pub fn new(quota: i64, window: Duration) -> Self {
        Self {
            quota,
            window,
            global: false,
            headers: HeaderScheme::default(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Report every 429 as an account-wide limit.
    pub fn with_global_limits(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    /// Handle a request for `key`.
    pub fn handle(&self, key: &str) -> Result<FakeResponse> {
        let now = Instant::now();
        let (used, until_reset) = {
            let mut windows = self.windows.lock();
            let window = windows.entry(key.to_string()).or_insert(Window {
                start: now,
                used: 0,
            });
            if now.saturating_duration_since(window.start) >= self.window {
                window.start = now;
                window.used = 0;
            }
            window.used += 1;
            (
                window.used,
                (window.start + self.window).saturating_duration_since(now),
            )
        };

        let mut headers = HeaderMap::new();
        let date = Utc::now();
        insert(&mut headers, &self.headers.date, &http_date(date))?;
        insert(
            &mut headers,
            &self.headers.remaining,
            &(self.quota - used).max(0).to_string(),
        )?;
        // Reset relative to the second-resolution Date header
        let reset_epoch = date.timestamp() as f64 + until_reset.as_secs_f64();
        insert(&mut headers, &self.headers.reset, &format!("{:.3}", reset_epoch))?;

        if used <= self.quota {
            return Ok(FakeResponse {
                status: StatusCode::OK,
                headers,
                body: Vec::new(),
            });
        }

        let retry_after_ms = until_reset.as_millis().max(1) as u64;
        insert(&mut headers, &self.headers.retry_after, &retry_after_ms.to_string())?;
        if self.global {
            insert(&mut headers, &self.headers.global, "true")?;
        }

        let body = serde_json::to_vec(&TooManyRequests {
            bucket: Some(key.to_string()),
            message: "You are being rate limited.".to_string(),
            retry_after: retry_after_ms as f64 / 1000.0,
            global: self.global,
        })?;

        Ok(FakeResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            body,
        })
    }
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = http::header::HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| GateError::Config(format!("invalid header name {:?}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| GateError::Config(format!("invalid header value {:?}: {}", value, e)))?;
    headers.insert(name, value);
    Ok(())
}

fn http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    /// Requests answered with success
    pub admitted: usize,
    /// Requests answered with 429
    pub limited: usize,
    /// Releases that failed to parse headers
    pub errors: usize,
    /// Wall time of the run in milliseconds
    pub elapsed_ms: u64,
}

enum Outcome {
    Admitted,
    Limited,
    Error,
}

/// Send `config.requests` requests, round-robin over `config.keys`, through
/// the limiter to the server.
pub async fn run(
    limiter: Arc<RateLimiter>,
    server: Arc<FakeServer>,
    config: &SimulationConfig,
) -> SimulationReport {
    let start = Instant::now();
    let latency = Duration::from_millis(config.latency_ms);
    let keys = config.keys.clone();

    info!(
        requests = config.requests,
        concurrency = config.concurrency,
        keys = keys.len(),
        "Starting simulation"
    );

    let outcomes: Vec<Outcome> = stream::iter(0..config.requests)
        .filter_map(|i| {
            let key = keys.get(i % keys.len().max(1)).cloned();
            async move { key }
        })
        .map(|key| {
            let limiter = Arc::clone(&limiter);
            let server = Arc::clone(&server);
            async move { send(&limiter, &server, &key, latency).await }
        })
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;

    let mut report = SimulationReport::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Admitted => report.admitted += 1,
            Outcome::Limited => report.limited += 1,
            Outcome::Error => report.errors += 1,
        }
    }
    report.elapsed_ms = start.elapsed().as_millis() as u64;

    info!(
        admitted = report.admitted,
        limited = report.limited,
        errors = report.errors,
        elapsed_ms = report.elapsed_ms,
        "Simulation finished"
    );
    report
}

async fn send(limiter: &RateLimiter, server: &FakeServer, key: &str, latency: Duration) -> Outcome {
    let guard = limiter.lock_bucket(key).await;
    tokio::time::sleep(latency).await;

    let response = match server.handle(key) {
        Ok(response) => response,
        Err(e) => {
            warn!(key, error = %e, "Request failed");
            // No response, nothing to learn
            let _ = guard.release(None);
            return Outcome::Error;
        }
    };

    if let Err(e) = guard.release(Some(&response.headers)) {
        warn!(key, error = %e, "Failed to apply rate limit headers");
        return Outcome::Error;
    }

    if response.status == StatusCode::TOO_MANY_REQUESTS {
        match TooManyRequests::from_json(&response.body) {
            Ok(body) => debug!(
                key,
                retry_after_ms = body.retry_after_duration().as_millis() as u64,
                global = body.global,
                "Request was rate limited"
            ),
            Err(e) => warn!(key, error = %e, "Unreadable 429 body"),
        }
        Outcome::Limited
    } else {
        Outcome::Admitted
    }
}

/// Log rate limit notifications until the limiter is dropped.
///
/// A slow reader skips the notifications it lagged behind on and keeps going.
/// Returns the number of notifications logged.
pub async fn log_events(mut events: broadcast::Receiver<RateLimitEvent>) -> usize {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                warn!(
                    key = %event.key,
                    retry_after_ms = event.retry_after.as_millis() as u64,
                    global = event.global,
                    "Rate limited by server"
                );
                logged += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Rate limit notifications dropped");
            }
            Err(RecvError::Closed) => return logged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(keys: &[&str], requests: usize, concurrency: usize) -> SimulationConfig {
        SimulationConfig {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            requests,
            concurrency,
            server_quota: 2,
            window_ms: 1000,
            latency_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_log_events_survives_lag() {
        let (tx, rx) = broadcast::channel(1);
        for key in ["a", "b", "c"] {
            tx.send(RateLimitEvent {
                key: key.to_string(),
                retry_after: Duration::from_secs(1),
                global: false,
            })
            .unwrap();
        }
        drop(tx);

        // "a" and "b" are overwritten; "c" still gets logged after the lag
        assert_eq!(log_events(rx).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_quota_and_headers() {
        let server = FakeServer::new(1, Duration::from_secs(1));

        let ok = server.handle("k").unwrap();
        assert_eq!(ok.status, StatusCode::OK);
        assert_eq!(ok.headers["X-RateLimit-Remaining"], "0");
        assert!(ok.headers.contains_key("Date"));
        assert!(!ok.headers.contains_key("Retry-After"));

        let limited = server.handle("k").unwrap();
        assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.headers["Retry-After"], "1000");
        let body = TooManyRequests::from_json(&limited.body).unwrap();
        assert!(!body.global);

        // Other keys have their own window
        assert_eq!(server.handle("other").unwrap().status, StatusCode::OK);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(server.handle("k").unwrap().status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_stays_within_server_quota() {
        let limiter = Arc::new(RateLimiter::new());
        let server = Arc::new(FakeServer::new(2, Duration::from_secs(1)));

        let report = run(limiter, server, &config(&["channels/1/messages"], 6, 3)).await;

        assert_eq!(report.admitted, 6);
        assert_eq!(report.limited, 0);
        assert_eq!(report.errors, 0);
        assert!(report.elapsed_ms >= 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loose_custom_limit_gets_limited() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.set_custom_rate_limit("/messages", 10, Duration::from_secs(1));
        let server = Arc::new(FakeServer::new(2, Duration::from_secs(1)));

        let report = run(limiter, server, &config(&["channels/1/messages"], 5, 1)).await;

        assert_eq!(report.admitted + report.limited, 5);
        assert!(report.limited > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit_is_broadcast() {
        let limiter = Arc::new(RateLimiter::new());
        let mut events = limiter.subscribe();
        let server = FakeServer::new(1, Duration::from_secs(1)).with_global_limits(true);

        server.handle("a").unwrap();
        let limited = server.handle("a").unwrap();
        assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);

        let guard = limiter.lock_bucket("a").await;
        guard.release(Some(&limited.headers)).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.key, "a");
        assert!(event.global);
        assert_eq!(event.retry_after, Duration::from_millis(1000));

        // An unrelated key waits for the global limit to lift
        let start = Instant::now();
        let guard = limiter.lock_bucket("b").await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
        guard.release(None).unwrap();
        assert!(limiter.global_reset().is_none());
    }
}
