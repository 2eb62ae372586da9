//! Typed limiter parameters and their positional argument encoding.
//!
//! The limiter boundary takes arguments by position, as strings. These
//! structs are the typed way to build those lists:
//!
//! | Limiter | Arguments |
//! |---|---|
//! | fixed window | `limit, window_ms, now` |
//! | sliding window | `now, limit, window_ms` |
//! | leaky bucket | `capacity, rate, now` |
//! | token bucket | `capacity, rate, now` |
//! | hybrid bucket | `token_limit, queue_limit, window_ms, now` |

use serde::{Deserialize, Serialize};
use warden_common::{Result, WardenError};

fn require_window(window_ms: u64) -> Result<()> {
    if window_ms == 0 {
        return Err(WardenError::IllegalArgument(
            "window must be at least 1ms".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedWindowParams {
    pub limit: u64,
    pub window_ms: u64,
}

impl Default for FixedWindowParams {
    fn default() -> Self {
        Self {
            limit: 100,
            window_ms: 1_000,
        }
    }
}

impl FixedWindowParams {
    pub fn validate(&self) -> Result<()> {
        require_window(self.window_ms)
    }

    pub fn to_args(&self, now: u64) -> Vec<String> {
        vec![
            self.limit.to_string(),
            self.window_ms.to_string(),
            now.to_string(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlidingWindowParams {
    pub limit: u64,
    pub window_ms: u64,
}

impl Default for SlidingWindowParams {
    fn default() -> Self {
        Self {
            limit: 100,
            window_ms: 1_000,
        }
    }
}

impl SlidingWindowParams {
    pub fn validate(&self) -> Result<()> {
        require_window(self.window_ms)
    }

    pub fn to_args(&self, now: u64) -> Vec<String> {
        vec![
            now.to_string(),
            self.limit.to_string(),
            self.window_ms.to_string(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakyBucketParams {
    pub capacity: u64,
    /// Requests drained per second
    pub rate: u64,
}

impl Default for LeakyBucketParams {
    fn default() -> Self {
        Self {
            capacity: 100,
            rate: 10,
        }
    }
}

impl LeakyBucketParams {
    pub fn to_args(&self, now: u64) -> Vec<String> {
        vec![
            self.capacity.to_string(),
            self.rate.to_string(),
            now.to_string(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketParams {
    pub capacity: u64,
    /// Tokens generated per second
    pub rate: u64,
}

impl Default for TokenBucketParams {
    fn default() -> Self {
        Self {
            capacity: 100,
            rate: 10,
        }
    }
}

impl TokenBucketParams {
    pub fn to_args(&self, now: u64) -> Vec<String> {
        vec![
            self.capacity.to_string(),
            self.rate.to_string(),
            now.to_string(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridBucketParams {
    pub token_limit: u64,
    pub queue_limit: u64,
    /// Lifetime of the token counter and of the overflow queue
    pub window_ms: u64,
}

impl Default for HybridBucketParams {
    fn default() -> Self {
        Self {
            token_limit: 150,
            queue_limit: 100,
            window_ms: 1_000,
        }
    }
}

impl HybridBucketParams {
    pub fn validate(&self) -> Result<()> {
        require_window(self.window_ms)
    }

    pub fn to_args(&self, now: u64) -> Vec<String> {
        vec![
            self.token_limit.to_string(),
            self.queue_limit.to_string(),
            self.window_ms.to_string(),
            now.to_string(),
        ]
    }
}
