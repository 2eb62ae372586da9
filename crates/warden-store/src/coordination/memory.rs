//! In-process coordination service with sessions, sequential ephemeral
//! nodes and one-shot watches.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use warden_common::{Result, WardenError};

use super::{CoordinationService, SEQUENCE_WIDTH, WatchEvent};

#[derive(Debug, Default)]
struct Node {
    ephemeral_owner: Option<u64>,
    child_sequence: u64,
}

struct Watch {
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<Watch>>,
    sessions: HashSet<u64>,
    pending_failures: u32,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::default());
        Self {
            nodes,
            watches: HashMap::new(),
            sessions: HashSet::new(),
            pending_failures: 0,
        }
    }

    fn check(&mut self, session: u64) -> Result<()> {
        if !self.sessions.contains(&session) {
            return Err(WardenError::SessionExpired(format!("session {}", session)));
        }
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(WardenError::Coordination(
                "simulated connection loss".to_string(),
            ));
        }
        Ok(())
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        if let Some(watches) = self.watches.remove(path) {
            for watch in watches {
                let _ = watch.tx.send(WatchEvent::NodeDeleted);
            }
        }
    }

    fn end_session(&mut self, session: u64) -> usize {
        if !self.sessions.remove(&session) {
            return 0;
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.remove_node(path);
        }
        for watches in self.watches.values_mut() {
            let (mine, others): (Vec<Watch>, Vec<Watch>) =
                watches.drain(..).partition(|w| w.session == session);
            *watches = others;
            for watch in mine {
                let _ = watch.tx.send(WatchEvent::SessionLost);
            }
        }
        self.watches.retain(|_, w| !w.is_empty());
        owned.len()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn validate(path: &str) -> Result<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(WardenError::IllegalArgument(format!(
            "invalid node path '{}'",
            path
        )));
    }
    Ok(())
}

/// Shared in-memory coordination tree; hand out sessions with [`connect`](Self::connect)
#[derive(Clone)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new session
    pub fn connect(&self) -> CoordinatorSession {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.tree.lock().sessions.insert(id);
        debug!(session = id, "Coordination session opened");
        CoordinatorSession {
            id,
            tree: self.tree.clone(),
        }
    }

    /// End a session as if its client had crashed: its ephemeral nodes are
    /// removed and its own watches fire with [`WatchEvent::SessionLost`]
    pub fn expire_session(&self, session: u64) {
        let removed = self.tree.lock().end_session(session);
        debug!(session, removed, "Coordination session expired");
    }

    /// Make the next `count` operations fail with a transient error
    pub fn inject_failures(&self, count: u32) {
        self.tree.lock().pending_failures = count;
    }

    /// Whether a node exists, without registering a watch
    pub fn node_exists(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }
}

/// A live session; ending it (explicitly or by drop) removes its ephemeral nodes
pub struct CoordinatorSession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
}

impl CoordinatorSession {
    pub fn close(&self) {
        self.tree.lock().end_session(self.id);
    }
}

impl Drop for CoordinatorSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl CoordinationService for CoordinatorSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn ensure_path(&self, path: &str) -> Result<()> {
        validate(path)?;
        let mut tree = self.tree.lock();
        tree.check(self.id)?;
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match tree.nodes.get(&current).map(|n| n.ephemeral_owner.is_some()) {
                Some(true) => {
                    return Err(WardenError::IllegalArgument(format!(
                        "ephemeral node '{}' cannot have children",
                        current
                    )));
                }
                Some(false) => {}
                None => {
                    tree.nodes.insert(current.clone(), Node::default());
                }
            }
        }
        Ok(())
    }

    async fn create_sequential_ephemeral(&self, prefix: &str) -> Result<String> {
        validate(prefix)?;
        let mut tree = self.tree.lock();
        tree.check(self.id)?;
        let parent = parent_of(prefix).to_string();
        let sequence = match tree.nodes.get_mut(&parent) {
            Some(node) if node.ephemeral_owner.is_none() => {
                let sequence = node.child_sequence;
                node.child_sequence += 1;
                sequence
            }
            Some(_) => {
                return Err(WardenError::IllegalArgument(format!(
                    "ephemeral node '{}' cannot have children",
                    parent
                )));
            }
            None => {
                return Err(WardenError::IllegalArgument(format!(
                    "no node '{}'",
                    parent
                )));
            }
        };
        let path = format!("{}{:0width$}", prefix, sequence, width = SEQUENCE_WIDTH);
        tree.nodes.insert(
            path.clone(),
            Node {
                ephemeral_owner: Some(self.id),
                child_sequence: 0,
            },
        );
        Ok(path)
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        validate(path)?;
        let mut tree = self.tree.lock();
        tree.check(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Err(WardenError::IllegalArgument(format!("no node '{}'", path)));
        }
        let prefix = child_prefix(path);
        Ok(tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let name = &k[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
            })
            .collect())
    }

    async fn exists_with_watch(&self, path: &str) -> Result<Option<oneshot::Receiver<WatchEvent>>> {
        validate(path)?;
        let mut tree = self.tree.lock();
        tree.check(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        tree.watches.entry(path.to_string()).or_default().push(Watch {
            session: self.id,
            tx,
        });
        Ok(Some(rx))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate(path)?;
        if path == "/" {
            return Err(WardenError::IllegalArgument("cannot delete root".to_string()));
        }
        let mut tree = self.tree.lock();
        tree.check(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Err(WardenError::IllegalArgument(format!("no node '{}'", path)));
        }
        if tree.has_children(path) {
            return Err(WardenError::IllegalArgument(format!(
                "node '{}' not empty",
                path
            )));
        }
        tree.remove_node(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_nodes_are_ordered() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.connect();
        session.ensure_path("/distributed").await.unwrap();

        let a = session
            .create_sequential_ephemeral("/distributed/stock-")
            .await
            .unwrap();
        let b = session
            .create_sequential_ephemeral("/distributed/stock-")
            .await
            .unwrap();
        assert_eq!(a, "/distributed/stock-0000000000");
        assert_eq!(b, "/distributed/stock-0000000001");

        let mut children = session.list_children("/distributed").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["stock-0000000000", "stock-0000000001"]);
    }

    #[tokio::test]
    async fn test_watch_fires_on_delete() {
        let coordinator = MemoryCoordinator::new();
        let owner = coordinator.connect();
        let watcher = coordinator.connect();
        owner.ensure_path("/distributed").await.unwrap();
        let node = owner
            .create_sequential_ephemeral("/distributed/a-")
            .await
            .unwrap();

        let rx = watcher.exists_with_watch(&node).await.unwrap().unwrap();
        owner.delete(&node).await.unwrap();
        assert_eq!(rx.await.unwrap(), WatchEvent::NodeDeleted);

        assert!(watcher.exists_with_watch(&node).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_end_removes_ephemeral_nodes() {
        let coordinator = MemoryCoordinator::new();
        let watcher = coordinator.connect();
        watcher.ensure_path("/distributed").await.unwrap();

        let rx = {
            let owner = coordinator.connect();
            let node = owner
                .create_sequential_ephemeral("/distributed/a-")
                .await
                .unwrap();
            let rx = watcher.exists_with_watch(&node).await.unwrap().unwrap();
            assert!(coordinator.node_exists(&node));
            rx
        };

        assert_eq!(rx.await.unwrap(), WatchEvent::NodeDeleted);
        assert!(watcher.list_children("/distributed").await.unwrap().is_empty());
        assert!(coordinator.node_exists("/distributed"));
    }

    #[tokio::test]
    async fn test_expired_session_loses_its_watches() {
        let coordinator = MemoryCoordinator::new();
        let owner = coordinator.connect();
        let watcher = coordinator.connect();
        owner.ensure_path("/distributed").await.unwrap();
        let node = owner
            .create_sequential_ephemeral("/distributed/a-")
            .await
            .unwrap();

        let rx = watcher.exists_with_watch(&node).await.unwrap().unwrap();
        coordinator.expire_session(watcher.session_id());

        assert_eq!(rx.await.unwrap(), WatchEvent::SessionLost);
        assert!(matches!(
            watcher.list_children("/distributed").await,
            Err(WardenError::SessionExpired(_))
        ));
        assert!(coordinator.node_exists(&node));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.connect();
        coordinator.inject_failures(1);

        let err = session.ensure_path("/x").await.unwrap_err();
        assert!(err.is_transient());
        session.ensure_path("/x").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_guards() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.connect();
        session.ensure_path("/a/b").await.unwrap();

        assert!(session.delete("/a").await.is_err());
        assert!(session.delete("/missing").await.is_err());
        session.delete("/a/b").await.unwrap();
        session.delete("/a").await.unwrap();
        assert!(session.create_sequential_ephemeral("/a/x-").await.is_err());
    }
}
