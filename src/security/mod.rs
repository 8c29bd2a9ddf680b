//! Request admission: who is calling, whether they are exempt, and whether
//! they still have budget.
//!
//! - [`resolve_tracker`] maps a request to the [`CallerIdentity`] its counters are keyed on.
//! - [`should_skip`] exempts administrators from throttling.
//! - [`ThrottlerMiddleware`] enforces the fixed-window buckets.
//! - [`CorsMiddleware`] handles cross-origin browser access.
//!
//! The two policy functions are pure and take the principal explicitly; the
//! middleware is the only place that reads it out of the [`Context`](crate::context::Context).

pub mod bypass;
pub mod cors;
pub mod throttle;
pub mod tracker;

pub use bypass::should_skip;
pub use cors::CorsMiddleware;
pub use throttle::{
    DEFAULT_BUCKET, MemoryThrottleStorage, RateLimitRule, RouteRateLimit, ThrottleBucket,
    ThrottleError, ThrottleRecord, ThrottleStorage, ThrottlerMiddleware,
};
pub use tracker::{CallerIdentity, resolve_tracker};
