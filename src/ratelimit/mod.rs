//! Rate limiting logic and state management.

mod bucket;
mod custom;
mod events;
mod global;
mod headers;
mod limiter;
mod route;

pub use bucket::{Bucket, BucketGuard};
pub use custom::{CustomRateLimit, CustomRateLimitConfig, Quota};
pub use events::{RateLimitEvent, TooManyRequests};
pub use global::GlobalThrottle;
pub use headers::HeaderScheme;
pub use limiter::{AttachPolicy, LimiterSettings, RateLimiter, DEFAULT_SAFETY_MARGIN};
pub use route::RouteKey;
