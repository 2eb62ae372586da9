//! Fire a batch of requests through one named rate limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::info;
use warden_common::Clock;
use warden_ratelimit::RateLimiterRegistry;

use crate::config::LimitOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitReport {
    pub limiter: String,
    pub key: String,
    pub started_at: DateTime<Utc>,
    pub admitted: u64,
    pub rejected: u64,
    pub elapsed: Duration,
}

/// Send `options.requests` sequential requests, each stamped with `clock`
pub async fn run_limit(
    registry: &RateLimiterRegistry,
    options: &LimitOptions,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<LimitReport> {
    let limiter = registry.get(&options.limiter)?;
    info!(
        limiter = limiter.name(),
        key = %options.key,
        requests = options.requests,
        "Starting limit run"
    );

    let started_at = Utc::now();
    let started = Instant::now();
    let (mut admitted, mut rejected) = (0u64, 0u64);
    for _ in 0..options.requests {
        let args = options.args(clock.now_millis())?;
        if limiter.allow(&options.key, &args).await? {
            admitted += 1;
        } else {
            rejected += 1;
        }
    }

    let report = LimitReport {
        limiter: limiter.name().to_string(),
        key: options.key.clone(),
        started_at,
        admitted,
        rejected,
        elapsed: started.elapsed(),
    };
    info!(
        limiter = %report.limiter,
        admitted = report.admitted,
        rejected = report.rejected,
        "Limit run finished"
    );
    Ok(report)
}
