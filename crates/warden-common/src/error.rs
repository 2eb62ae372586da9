//! Error types and error codes for Warden
//!
//! This module defines:
//! - `WardenError`: library error enum shared by every crate
//! - `ErrorCode`: structured codes callers can surface to their own clients

use serde::{Deserialize, Serialize};

/// Library-wide error type
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WardenError {
    /// The atomic-script store could not be reached or timed out
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The coordination service could not be reached or rejected a request
    #[error("coordination error: {0}")]
    Coordination(String),

    /// The coordination session backing ephemeral nodes is gone
    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("lock '{lock}' is not held by '{holder}'")]
    NotOwner { lock: String, holder: String },

    #[error("no rate limiter named: {0}")]
    UnknownLimiter(String),

    #[error("invalid script '{id}': {reason}")]
    InvalidScript { id: String, reason: String },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("rate limit exceeded: {limiter}")]
    RateLimited { limiter: String },
}

impl WardenError {
    /// Whether the failure may succeed on retry.
    ///
    /// Only transport-level failures qualify. Ownership violations and
    /// configuration mistakes are logic errors and retrying cannot fix them.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Coordination(_))
    }

    pub fn code(&self) -> ErrorCode<'static> {
        match self {
            Self::StoreUnavailable(_) => STORE_UNAVAILABLE,
            Self::Coordination(_) | Self::SessionExpired(_) => COORDINATION_ERROR,
            Self::NotOwner { .. } => NOT_LOCK_OWNER,
            Self::UnknownLimiter(_) => UNKNOWN_LIMITER,
            Self::InvalidScript { .. } => INVALID_SCRIPT,
            Self::IllegalArgument(_) | Self::ConfigError(_) => PARAMETER_VALIDATE_ERROR,
            Self::RateLimited { .. } => RATE_LIMITED,
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;

/// Error code structure for responses built by callers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const PARAMETER_VALIDATE_ERROR: ErrorCode<'static> = ErrorCode {
    code: 20002,
    message: "parameter validate error",
};

pub const STORE_UNAVAILABLE: ErrorCode<'static> = ErrorCode {
    code: 30001,
    message: "store unavailable",
};

pub const COORDINATION_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30002,
    message: "coordination service error",
};

pub const NOT_LOCK_OWNER: ErrorCode<'static> = ErrorCode {
    code: 30003,
    message: "lock not owned by caller",
};

pub const INVALID_SCRIPT: ErrorCode<'static> = ErrorCode {
    code: 30005,
    message: "invalid store script",
};

pub const UNKNOWN_LIMITER: ErrorCode<'static> = ErrorCode {
    code: 40001,
    message: "no such rate limiter",
};

pub const RATE_LIMITED: ErrorCode<'static> = ErrorCode {
    code: 429,
    message: "rate limit exceeded",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(WardenError::StoreUnavailable("conn reset".into()).is_transient());
        assert!(WardenError::Coordination("timeout".into()).is_transient());

        assert!(
            !WardenError::NotOwner {
                lock: "stock".into(),
                holder: "a:1".into()
            }
            .is_transient()
        );
        assert!(!WardenError::UnknownLimiter("nope".into()).is_transient());
        assert!(!WardenError::SessionExpired("s-1".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = WardenError::NotOwner {
            lock: "stock".into(),
            holder: "client:7".into(),
        };
        assert_eq!(err.to_string(), "lock 'stock' is not held by 'client:7'");

        let err = WardenError::RateLimited {
            limiter: "tokenBucketRateLimiter".into(),
        };
        assert_eq!(err.to_string(), "rate limit exceeded: tokenBucketRateLimiter");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            WardenError::RateLimited {
                limiter: "x".into()
            }
            .code(),
            RATE_LIMITED
        );
        assert_eq!(WardenError::SessionExpired("s-1".into()).code(), COORDINATION_ERROR);
        assert_eq!(WardenError::ConfigError("x".into()).code().code, 20002);
        assert_eq!(
            serde_json::to_string(&NOT_LOCK_OWNER).unwrap(),
            r#"{"code":30003,"message":"lock not owned by caller"}"#
        );
    }
}
