//! Strategy selector: name to limiter lookup

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use warden_common::{Clock, Result, SystemClock, WardenError};
use warden_store::{Script, ScriptExecutor};

use crate::limiter::{
    FixedWindowRateLimiter, HybridBucketRateLimiter, LeakyBucketRateLimiter, RateLimiter,
    SlidingWindowRateLimiter, TokenBucketRateLimiter,
};

/// Immutable table of named limiters, built once at startup
pub struct RateLimiterRegistry {
    limiters: HashMap<&'static str, Arc<dyn RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn builder() -> RateLimiterRegistryBuilder {
        RateLimiterRegistryBuilder::default()
    }

    /// Registry with all five algorithms on one store
    pub fn standard(executor: Arc<dyn ScriptExecutor>) -> Self {
        Self::standard_with_clock(executor, Arc::new(SystemClock))
    }

    pub fn standard_with_clock(executor: Arc<dyn ScriptExecutor>, clock: Arc<dyn Clock>) -> Self {
        let limiters: [Arc<dyn RateLimiter>; 5] = [
            Arc::new(FixedWindowRateLimiter::with_clock(executor.clone(), clock.clone())),
            Arc::new(SlidingWindowRateLimiter::with_clock(executor.clone(), clock.clone())),
            Arc::new(LeakyBucketRateLimiter::with_clock(executor.clone(), clock.clone())),
            Arc::new(TokenBucketRateLimiter::with_clock(executor.clone(), clock.clone())),
            Arc::new(HybridBucketRateLimiter::with_clock(executor, clock)),
        ];
        Self {
            limiters: limiters.into_iter().map(|l| (l.name(), l)).collect(),
        }
    }

    /// Look up a limiter by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn RateLimiter>> {
        self.limiters
            .get(name)
            .cloned()
            .ok_or_else(|| WardenError::UnknownLimiter(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.limiters.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Scripts of every registered limiter, for loading at startup
    pub fn scripts(&self) -> Vec<Script> {
        let mut scripts: Vec<Script> = self
            .limiters
            .values()
            .flat_map(|l| l.scripts().iter().copied())
            .collect();
        scripts.sort_by_key(|s| s.id());
        scripts.dedup_by_key(|s| s.id());
        scripts
    }

    /// Run `allow` and turn a denial into [`WardenError::RateLimited`]
    pub async fn enforce(&self, name: &str, key: &str, args: &[String]) -> Result<()> {
        let limiter = self.get(name)?;
        if limiter.allow(key, args).await? {
            return Ok(());
        }
        warn!(limiter = name, key, "Rate limit exceeded");
        Err(WardenError::RateLimited {
            limiter: name.to_string(),
        })
    }
}

#[derive(Default)]
pub struct RateLimiterRegistryBuilder {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl RateLimiterRegistryBuilder {
    pub fn register(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiters.push(limiter);
        self
    }

    /// Freeze the table; two limiters with one name is a configuration error
    pub fn build(self) -> Result<RateLimiterRegistry> {
        let mut limiters = HashMap::with_capacity(self.limiters.len());
        for limiter in self.limiters {
            let name = limiter.name();
            if limiters.insert(name, limiter).is_some() {
                return Err(WardenError::ConfigError(format!(
                    "rate limiter '{}' registered twice",
                    name
                )));
            }
        }
        info!(count = limiters.len(), "Rate limiter registry built");
        Ok(RateLimiterRegistry { limiters })
    }
}
