//! Bucketgate - Client-side Rate Limit Enforcement
//!
//! This crate implements the admission control layer of a REST API client.
//! Requests are grouped into buckets by key; each bucket learns its quota
//! from response headers (or from a statically configured custom rate limit)
//! and holds back requests that would exceed it. A global throttle set by any
//! bucket holds back every bucket.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod simulate;

pub use error::{GateError, Result};
pub use ratelimit::{BucketGuard, RateLimiter};
