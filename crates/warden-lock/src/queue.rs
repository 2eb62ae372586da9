//! Queue-ordered (FIFO) distributed lock on a hierarchical coordination
//! service.
//!
//! Every waiter creates an ephemeral sequential node `<name>-<seq>` under a
//! shared root. The node with the smallest sequence holds the lock; every
//! other waiter watches only its immediate predecessor, so a release wakes
//! exactly one successor. A crashed holder's node vanishes with its
//! session.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_common::{DEFAULT_QUEUE_RETRY_BACKOFF, DEFAULT_QUEUE_ROOT, Result, WardenError};
use warden_store::{CoordinationService, WatchEvent};

const KIND: &str = "queue";

/// Tuning of queue-ordered locks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueLockOptions {
    /// Persistent parent of all sequence nodes
    pub root_path: String,
    /// Pause before retrying after a transient coordination error
    pub retry_backoff_ms: u64,
}

impl Default for QueueLockOptions {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_QUEUE_ROOT.to_string(),
            retry_backoff_ms: DEFAULT_QUEUE_RETRY_BACKOFF.as_millis() as u64,
        }
    }
}

impl QueueLockOptions {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root_path.starts_with('/') {
            return Err(WardenError::IllegalArgument(format!(
                "root path must be absolute: '{}'",
                self.root_path
            )));
        }
        Ok(())
    }
}

/// Where a queue lock handle is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueLockState {
    Unacquired,
    /// Sequence node created, waiting on a predecessor
    Enqueued,
    Holding,
    Released,
}

/// Factory for queue-ordered locks sharing one coordination session
pub struct QueueLockClient {
    coordinator: Arc<dyn CoordinationService>,
    options: QueueLockOptions,
}

impl QueueLockClient {
    /// Connect the client, creating the root path if needed
    pub async fn new(
        coordinator: Arc<dyn CoordinationService>,
        options: QueueLockOptions,
    ) -> Result<Self> {
        options.validate()?;
        let client = Self {
            coordinator,
            options,
        };
        client.ensure_root().await?;
        Ok(client)
    }

    pub async fn ensure_root(&self) -> Result<()> {
        self.coordinator.ensure_path(&self.options.root_path).await?;
        info!(
            root = %self.options.root_path,
            session = self.coordinator.session_id(),
            "Queue lock root ready"
        );
        Ok(())
    }

    pub fn options(&self) -> &QueueLockOptions {
        &self.options
    }

    pub fn queue_lock(&self, name: impl Into<String>) -> QueueLock {
        QueueLock {
            coordinator: self.coordinator.clone(),
            root: self.options.root_path.trim_end_matches('/').to_string(),
            name: name.into(),
            retry_backoff: self.options.retry_backoff(),
            node: None,
            depth: 0,
            state: QueueLockState::Unacquired,
        }
    }
}

/// Handle on one named queue-ordered lock.
///
/// The handle carries the reentrancy depth: calling `lock` again while
/// holding only bumps the depth, and the node is deleted once the depth
/// returns to zero. Dropping a handle that still owns a node deletes it in
/// the background.
pub struct QueueLock {
    coordinator: Arc<dyn CoordinationService>,
    root: String,
    name: String,
    retry_backoff: Duration,
    node: Option<String>,
    depth: u32,
    state: QueueLockState,
}

impl QueueLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> QueueLockState {
        self.state
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Full path of this handle's sequence node, if one exists
    pub fn node_path(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Block until this handle holds the lock.
    ///
    /// Transient coordination errors are retried after the configured
    /// backoff, indefinitely.
    pub async fn lock(&mut self) -> Result<()> {
        if self.reenter() {
            return Ok(());
        }
        self.acquire(None).await.map(|_| ())
    }

    /// Like [`lock`](Self::lock) but gives up after `wait`.
    ///
    /// On timeout the sequence node is removed so successors are not held
    /// up, and `Ok(false)` is returned.
    pub async fn try_lock_for(&mut self, wait: Duration) -> Result<bool> {
        if self.reenter() {
            return Ok(true);
        }
        self.acquire(Some(Instant::now() + wait)).await
    }

    /// Release one level; the node goes away when the depth reaches zero
    pub async fn unlock(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(WardenError::NotOwner {
                lock: self.name.clone(),
                holder: self.node.clone().unwrap_or_default(),
            });
        }
        if self.depth > 1 {
            self.depth -= 1;
            return Ok(());
        }

        let Some(node) = self.node.take() else {
            return Err(WardenError::NotOwner {
                lock: self.name.clone(),
                holder: String::new(),
            });
        };
        match self.coordinator.delete(&node).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                self.node = Some(node);
                return Err(e);
            }
            Err(e) => {
                // Node is already gone with the session
                self.depth = 0;
                self.state = QueueLockState::Released;
                return Err(e);
            }
        }

        self.depth = 0;
        self.state = QueueLockState::Released;
        metrics::counter!("warden_lock_released_total", "kind" => KIND).increment(1);
        debug!(lock = %self.name, node = %node, "Queue lock released");
        Ok(())
    }

    fn reenter(&mut self) -> bool {
        if self.depth > 0 {
            self.depth += 1;
            return true;
        }
        false
    }

    async fn acquire(&mut self, deadline: Option<Instant>) -> Result<bool> {
        loop {
            match self.wait_for_turn(deadline).await {
                Ok(true) => {
                    self.depth = 1;
                    self.state = QueueLockState::Holding;
                    metrics::counter!("warden_lock_acquired_total", "kind" => KIND).increment(1);
                    debug!(lock = %self.name, node = ?self.node, "Queue lock acquired");
                    return Ok(true);
                }
                Ok(false) => {
                    self.abandon().await;
                    return Ok(false);
                }
                Err(e) if e.is_transient() => {
                    metrics::counter!("warden_lock_retry_total", "kind" => KIND).increment(1);
                    warn!(lock = %self.name, error = %e, "Queue lock attempt failed, retrying");
                    let mut pause = self.retry_backoff;
                    if let Some(deadline) = deadline {
                        let now = Instant::now();
                        if now >= deadline {
                            self.abandon().await;
                            return Ok(false);
                        }
                        pause = pause.min(deadline - now);
                    }
                    tokio::time::sleep(pause).await;
                }
                Err(WardenError::SessionExpired(reason)) => {
                    // Ephemeral node went with the session
                    self.node = None;
                    self.state = QueueLockState::Unacquired;
                    return Err(WardenError::SessionExpired(reason));
                }
                Err(e) => {
                    self.abandon().await;
                    return Err(e);
                }
            }
        }
    }

    /// Enqueue (once) and wait until no earlier sibling remains.
    ///
    /// `Ok(false)` means the deadline passed first.
    async fn wait_for_turn(&mut self, deadline: Option<Instant>) -> Result<bool> {
        let prefix = format!("{}-", self.name);
        let node = match &self.node {
            Some(node) => node.clone(),
            None => {
                let node = self
                    .coordinator
                    .create_sequential_ephemeral(&format!("{}/{}", self.root, prefix))
                    .await?;
                debug!(lock = %self.name, node = %node, "Enqueued");
                self.node = Some(node.clone());
                self.state = QueueLockState::Enqueued;
                node
            }
        };
        let own_name = node.rsplit('/').next().unwrap_or_default();
        let own_seq = sequence_after(own_name, &prefix).ok_or_else(|| {
            WardenError::Coordination(format!("unexpected sequence node '{}'", node))
        })?;

        loop {
            let children = self.coordinator.list_children(self.root_or_slash()).await?;
            if !children.iter().any(|child| child == own_name) {
                return Err(WardenError::SessionExpired(format!(
                    "sequence node '{}' disappeared",
                    node
                )));
            }
            let Some(predecessor) = predecessor(&children, &prefix, own_seq) else {
                return Ok(true);
            };

            let path = format!("{}/{}", self.root, predecessor);
            let Some(watch) = self.coordinator.exists_with_watch(&path).await? else {
                // Deleted between listing and watching
                continue;
            };
            debug!(lock = %self.name, waiting_on = %path, "Waiting for predecessor");

            let event = match deadline {
                None => watch.await,
                Some(deadline) => match tokio::time::timeout_at(deadline, watch).await {
                    Ok(event) => event,
                    Err(_) => return Ok(false),
                },
            };
            match event {
                Ok(WatchEvent::NodeDeleted) => continue,
                Ok(WatchEvent::SessionLost) | Err(_) => {
                    return Err(WardenError::SessionExpired(format!(
                        "session {} lost while waiting on '{}'",
                        self.coordinator.session_id(),
                        path
                    )));
                }
            }
        }
    }

    fn root_or_slash(&self) -> &str {
        if self.root.is_empty() { "/" } else { &self.root }
    }

    /// Withdraw from the queue after giving up
    async fn abandon(&mut self) {
        if let Some(node) = self.node.take() {
            if let Err(e) = self.coordinator.delete(&node).await {
                warn!(
                    lock = %self.name,
                    node = %node,
                    error = %e,
                    "Failed to remove abandoned node"
                );
            }
        }
        self.state = QueueLockState::Unacquired;
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let Some(node) = self.node.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                lock = %self.name,
                node = %node,
                "No runtime to remove node, it lives until the session ends"
            );
            return;
        };
        let coordinator = self.coordinator.clone();
        handle.spawn(async move {
            if let Err(e) = coordinator.delete(&node).await {
                debug!(node = %node, error = %e, "Failed to remove node of dropped lock");
            }
        });
    }
}

impl std::fmt::Debug for QueueLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueLock")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("depth", &self.depth)
            .field("state", &self.state)
            .finish()
    }
}

/// Sequence of `child` if it is a node of the lock whose prefix is `prefix`
fn sequence_after(child: &str, prefix: &str) -> Option<u64> {
    let suffix = child.strip_prefix(prefix)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Sibling with the largest sequence strictly below `own`
fn predecessor<'a>(children: &'a [String], prefix: &str, own: u64) -> Option<&'a str> {
    children
        .iter()
        .filter_map(|child| Some((sequence_after(child, prefix)?, child.as_str())))
        .filter(|(seq, _)| *seq < own)
        .max_by_key(|(seq, _)| *seq)
        .map(|(_, child)| child)
}
