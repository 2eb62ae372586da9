//! Hierarchical coordination service boundary.
//!
//! Models the subset of a ZooKeeper-style service that queue-ordered locks
//! need: persistent paths, sequential ephemeral children, child listing,
//! one-shot existence watches and deletion.

mod memory;
#[cfg(feature = "zookeeper")]
mod zookeeper;

pub use memory::{CoordinatorSession, MemoryCoordinator};
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZooKeeperCoordinator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use warden_common::Result;

/// Width of the zero-padded sequence suffix on sequential nodes
pub const SEQUENCE_WIDTH: usize = 10;

/// Why a one-shot watch fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEvent {
    /// The watched node was deleted (explicitly or with its owner's session)
    NodeDeleted,
    /// The session that registered the watch is gone
    SessionLost,
}

/// A client session against a coordination service
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Identifier of the underlying session
    fn session_id(&self) -> u64;

    /// Create `path` and any missing ancestors as persistent nodes; idempotent
    async fn ensure_path(&self, path: &str) -> Result<()>;

    /// Create an ephemeral node named `prefix` + a monotonic sequence number.
    ///
    /// Returns the full path of the created node. The node disappears when
    /// this session ends.
    async fn create_sequential_ephemeral(&self, prefix: &str) -> Result<String>;

    /// Names (not full paths) of the children of `path`
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    /// Register a one-shot watch on `path`.
    ///
    /// Returns `None` if the node does not exist at registration time;
    /// otherwise the receiver resolves exactly once, on deletion of the node
    /// or loss of this session.
    async fn exists_with_watch(&self, path: &str) -> Result<Option<oneshot::Receiver<WatchEvent>>>;

    async fn delete(&self, path: &str) -> Result<()>;
}
