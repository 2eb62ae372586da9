//! Warden Lock - distributed mutual exclusion
//!
//! Two lock kinds with the same acquire/release shape:
//! - [`LeaseLock`]: reentrant lock held as an expiring record in an atomic
//!   script store, kept alive by background renewal
//! - [`QueueLock`]: fair FIFO lock built from sequential ephemeral nodes on
//!   a coordination service

pub mod lease;
pub mod queue;
mod renewal;
pub mod scripts;

pub use lease::{LeaseLock, LeaseLockClient, LeaseLockOptions};
pub use queue::{QueueLock, QueueLockClient, QueueLockOptions, QueueLockState};
pub use scripts::LOCK_SCRIPTS;
