//! Warden Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Warden components:
//! - Error types and error codes
//! - Millisecond clocks
//! - Common defaults

pub mod clock;
pub mod error;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock, current_millis};
pub use error::{ErrorCode, Result, WardenError};

use std::time::Duration;

/// Default lease for lease-based locks
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Sleep between acquisition attempts of a contended lease-based lock
pub const DEFAULT_ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Root node under which queue-ordered lock nodes are created
pub const DEFAULT_QUEUE_ROOT: &str = "/distributed";

/// Backoff before a queue-ordered lock retries after a transient error
pub const DEFAULT_QUEUE_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Idle expiry of bucket-style limiter state, in milliseconds
pub const BUCKET_STATE_TTL_MS: u64 = 60_000;
