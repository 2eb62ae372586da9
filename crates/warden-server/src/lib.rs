//! Warden Server - runner wiring locks and rate limiters to a store
//!
//! This crate provides:
//! - Layered configuration (file, environment, command line)
//! - Logging and metrics initialization
//! - Store backend selection
//! - The `stock` and `limit` runs

pub mod backend;
pub mod config;
pub mod limit;
pub mod logging;
pub mod metrics;
pub mod stock;

pub use backend::{Backend, Coordination};
pub use config::{Cli, Configuration, LockKind, RunMode};
pub use limit::{LimitReport, run_limit};
pub use stock::{StockReport, StockService, run_stock};

use warden_common::{ErrorCode, WardenError};

/// Code of the library error behind a failed run, if there is one
pub fn error_code(err: &anyhow::Error) -> Option<ErrorCode<'static>> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<WardenError>())
        .map(WardenError::code)
}
