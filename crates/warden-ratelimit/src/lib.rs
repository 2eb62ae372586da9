//! Warden Rate Limit - admission control against a shared store
//!
//! Five algorithms, each evaluated as one atomic script so concurrent
//! callers never double-count:
//! - fixed window counter
//! - sliding window log
//! - leaky bucket
//! - token bucket
//! - hybrid token counter with overflow queue
//!
//! [`RateLimiterRegistry`] maps the symbolic limiter names to instances.

pub mod algorithm;
pub mod limiter;
pub mod params;
pub mod registry;
pub mod scripts;

pub use algorithm::{Decision, HybridAdmission, LeakyState, TokenState};
pub use limiter::{
    FIXED_WINDOW_LIMITER, FixedWindowRateLimiter, HYBRID_BUCKET_LIMITER, HybridBucketRateLimiter,
    LEAKY_BUCKET_LIMITER, LeakyBucketRateLimiter, RateLimiter, SLIDING_WINDOW_LIMITER,
    SlidingWindowRateLimiter, TOKEN_BUCKET_LIMITER, TokenBucketRateLimiter,
};
pub use params::{
    FixedWindowParams, HybridBucketParams, LeakyBucketParams, SlidingWindowParams,
    TokenBucketParams,
};
pub use registry::{RateLimiterRegistry, RateLimiterRegistryBuilder};
