//! The rate limiter family.
//!
//! Every limiter namespaces its keys by algorithm, so the same caller key
//! used with two algorithms never shares state.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use warden_common::{Clock, Result, SystemClock, WardenError};
use warden_store::{Script, ScriptExecutor};

use crate::params::{
    FixedWindowParams, HybridBucketParams, LeakyBucketParams, SlidingWindowParams,
    TokenBucketParams,
};
use crate::scripts::{FIXED_WINDOW, HYBRID_BUCKET, LEAKY_BUCKET, SLIDING_WINDOW, TOKEN_BUCKET};

pub const FIXED_WINDOW_LIMITER: &str = "fixedWindowRateLimiter";
pub const SLIDING_WINDOW_LIMITER: &str = "slidingWindowRateLimiter";
pub const LEAKY_BUCKET_LIMITER: &str = "leakyBucketRateLimiter";
pub const TOKEN_BUCKET_LIMITER: &str = "tokenBucketRateLimiter";
pub const HYBRID_BUCKET_LIMITER: &str = "hybridBucketRateLimiter";

/// An admission decision backed by one atomic script
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Registry name of this limiter
    fn name(&self) -> &'static str;

    /// Scripts to register with the store at startup
    fn scripts(&self) -> &'static [Script];

    /// Decide whether one request under `key` may proceed.
    ///
    /// `args` are positional, as documented in [`crate::params`]. A denial
    /// is `Ok(false)`; store failures are returned as errors and leave no
    /// partial effect.
    async fn allow(&self, key: &str, args: &[String]) -> Result<bool>;
}

fn require_args(limiter: &str, args: &[String], expected: usize) -> Result<()> {
    if args.len() < expected {
        return Err(WardenError::IllegalArgument(format!(
            "{} expects {} arguments, got {}",
            limiter,
            expected,
            args.len()
        )));
    }
    Ok(())
}

/// Run a decision script and record its outcome
async fn decide(
    executor: &dyn ScriptExecutor,
    limiter: &'static str,
    script: &Script,
    keys: &[String],
    args: &[String],
) -> Result<bool> {
    let admitted = executor.execute(script, keys, args).await?.as_bool();
    let outcome = if admitted { "admitted" } else { "rejected" };
    metrics::counter!(
        "warden_ratelimit_decisions_total",
        "limiter" => limiter,
        "outcome" => outcome
    )
    .increment(1);
    debug!(limiter, key = %keys[0], outcome, "Rate limit decision");
    Ok(admitted)
}

macro_rules! limiter_struct {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name {
            executor: Arc<dyn ScriptExecutor>,
            clock: Arc<dyn Clock>,
        }

        impl $name {
            pub fn new(executor: Arc<dyn ScriptExecutor>) -> Self {
                Self::with_clock(executor, Arc::new(SystemClock))
            }

            /// Limiter whose typed `check` reads time from `clock`
            pub fn with_clock(executor: Arc<dyn ScriptExecutor>, clock: Arc<dyn Clock>) -> Self {
                Self { executor, clock }
            }
        }
    };
}

limiter_struct!(
    /// Counter per fixed window; the window starts with the first request
    FixedWindowRateLimiter
);
limiter_struct!(
    /// Counts requests in the trailing window ending now
    SlidingWindowRateLimiter
);
limiter_struct!(
    /// Admits while the bucket has room; drains at a constant rate
    LeakyBucketRateLimiter
);
limiter_struct!(
    /// Admits while tokens remain; refills at a constant rate
    TokenBucketRateLimiter
);
limiter_struct!(
    /// Token counter per window plus a bounded overflow queue
    HybridBucketRateLimiter
);

impl FixedWindowRateLimiter {
    pub async fn check(&self, key: &str, params: &FixedWindowParams) -> Result<bool> {
        params.validate()?;
        self.allow(key, &params.to_args(self.clock.now_millis())).await
    }
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    fn name(&self) -> &'static str {
        FIXED_WINDOW_LIMITER
    }

    fn scripts(&self) -> &'static [Script] {
        &[FIXED_WINDOW]
    }

    async fn allow(&self, key: &str, args: &[String]) -> Result<bool> {
        require_args(self.name(), args, 3)?;
        let keys = vec![format!("rate:fixed:{}", key)];
        decide(self.executor.as_ref(), self.name(), &FIXED_WINDOW, &keys, args).await
    }
}

impl SlidingWindowRateLimiter {
    pub async fn check(&self, key: &str, params: &SlidingWindowParams) -> Result<bool> {
        params.validate()?;
        self.allow(key, &params.to_args(self.clock.now_millis())).await
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    fn name(&self) -> &'static str {
        SLIDING_WINDOW_LIMITER
    }

    fn scripts(&self) -> &'static [Script] {
        &[SLIDING_WINDOW]
    }

    async fn allow(&self, key: &str, args: &[String]) -> Result<bool> {
        require_args(self.name(), args, 3)?;
        let keys = vec![format!("rate:sliding:{}", key)];
        // Nonce keeps same-millisecond requests distinct in the set
        let mut args = args[..3].to_vec();
        args.push(format!("{:016x}", rand::random::<u64>()));
        decide(self.executor.as_ref(), self.name(), &SLIDING_WINDOW, &keys, &args).await
    }
}

impl LeakyBucketRateLimiter {
    pub async fn check(&self, key: &str, params: &LeakyBucketParams) -> Result<bool> {
        self.allow(key, &params.to_args(self.clock.now_millis())).await
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketRateLimiter {
    fn name(&self) -> &'static str {
        LEAKY_BUCKET_LIMITER
    }

    fn scripts(&self) -> &'static [Script] {
        &[LEAKY_BUCKET]
    }

    async fn allow(&self, key: &str, args: &[String]) -> Result<bool> {
        require_args(self.name(), args, 3)?;
        let keys = vec![format!("rate:leaky:{}", key)];
        decide(self.executor.as_ref(), self.name(), &LEAKY_BUCKET, &keys, args).await
    }
}

impl TokenBucketRateLimiter {
    pub async fn check(&self, key: &str, params: &TokenBucketParams) -> Result<bool> {
        self.allow(key, &params.to_args(self.clock.now_millis())).await
    }
}

#[async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    fn name(&self) -> &'static str {
        TOKEN_BUCKET_LIMITER
    }

    fn scripts(&self) -> &'static [Script] {
        &[TOKEN_BUCKET]
    }

    async fn allow(&self, key: &str, args: &[String]) -> Result<bool> {
        require_args(self.name(), args, 3)?;
        let keys = vec![format!("rate:token:{}", key)];
        decide(self.executor.as_ref(), self.name(), &TOKEN_BUCKET, &keys, args).await
    }
}

impl HybridBucketRateLimiter {
    pub async fn check(&self, key: &str, params: &HybridBucketParams) -> Result<bool> {
        params.validate()?;
        self.allow(key, &params.to_args(self.clock.now_millis())).await
    }
}

#[async_trait]
impl RateLimiter for HybridBucketRateLimiter {
    fn name(&self) -> &'static str {
        HYBRID_BUCKET_LIMITER
    }

    fn scripts(&self) -> &'static [Script] {
        &[HYBRID_BUCKET]
    }

    async fn allow(&self, key: &str, args: &[String]) -> Result<bool> {
        require_args(self.name(), args, 4)?;
        let keys = vec![
            format!("rate:hybrid:{}", key),
            format!("rate:hybrid:{}:queue", key),
        ];
        decide(self.executor.as_ref(), self.name(), &HYBRID_BUCKET, &keys, args).await
    }
}
