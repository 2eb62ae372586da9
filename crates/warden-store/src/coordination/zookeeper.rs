//! ZooKeeper-backed coordination service.
//!
//! Every [`ZooKeeperCoordinator`] owns one ZooKeeper session, so the
//! sequential ephemeral nodes it creates vanish when the process holding
//! them goes away and queue-ordered locks exclude across processes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use warden_common::{Result, WardenError};
use zookeeper_client as zk;

use super::{CoordinationService, WatchEvent};

/// One ZooKeeper session
pub struct ZooKeeperCoordinator {
    client: zk::Client,
    session: u64,
}

impl ZooKeeperCoordinator {
    /// Open a session against `connect` (e.g. `127.0.0.1:2181,127.0.0.2:2181/chroot`)
    pub async fn connect(connect: &str, session_timeout: Duration) -> Result<Self> {
        let client = zk::Client::connector()
            .session_timeout(session_timeout)
            .connect(connect)
            .await
            .map_err(|e| {
                WardenError::Coordination(format!("failed to connect to '{}': {}", connect, e))
            })?;
        let session = client.session_id().0 as u64;
        info!(connect = %connect, session, "ZooKeeper session opened");
        Ok(Self { client, session })
    }
}

fn coordination_error(path: &str, e: zk::Error) -> WardenError {
    match e {
        zk::Error::SessionExpired | zk::Error::ClientClosed => {
            WardenError::SessionExpired(format!("{} on '{}'", e, path))
        }
        zk::Error::NoNode => WardenError::IllegalArgument(format!("no node '{}'", path)),
        zk::Error::NotEmpty => WardenError::IllegalArgument(format!("node '{}' not empty", path)),
        e => WardenError::Coordination(format!("{} on '{}'", e, path)),
    }
}

/// Wait for the watched node to go away, re-arming across data changes
async fn await_deletion(
    client: zk::Client,
    path: String,
    mut watcher: zk::OneshotWatcher,
    tx: oneshot::Sender<WatchEvent>,
) {
    loop {
        let event = watcher.changed().await;
        match event.event_type {
            zk::EventType::NodeDeleted => {
                let _ = tx.send(WatchEvent::NodeDeleted);
                return;
            }
            zk::EventType::Session => {
                debug!(path = %path, state = ?event.session_state, "Watch ended with session");
                let _ = tx.send(WatchEvent::SessionLost);
                return;
            }
            _ => {}
        }
        match client.check_and_watch_stat(&path).await {
            Ok((Some(_), next)) => watcher = next,
            Ok((None, _)) => {
                let _ = tx.send(WatchEvent::NodeDeleted);
                return;
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to re-arm watch");
                let _ = tx.send(WatchEvent::SessionLost);
                return;
            }
        }
    }
}

#[async_trait]
impl CoordinationService for ZooKeeperCoordinator {
    fn session_id(&self) -> u64 {
        self.session
    }

    async fn ensure_path(&self, path: &str) -> Result<()> {
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.client.create(&current, &[], &options).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(coordination_error(&current, e)),
            }
        }
        Ok(())
    }

    async fn create_sequential_ephemeral(&self, prefix: &str) -> Result<String> {
        let options = zk::CreateMode::EphemeralSequential.with_acls(zk::Acls::anyone_all());
        let (_, sequence) = self
            .client
            .create(prefix, &[], &options)
            .await
            .map_err(|e| coordination_error(prefix, e))?;
        Ok(format!("{}{}", prefix, sequence))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.client
            .list_children(path)
            .await
            .map_err(|e| coordination_error(path, e))
    }

    async fn exists_with_watch(&self, path: &str) -> Result<Option<oneshot::Receiver<WatchEvent>>> {
        let (stat, watcher) = self
            .client
            .check_and_watch_stat(path)
            .await
            .map_err(|e| coordination_error(path, e))?;
        if stat.is_none() {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        tokio::spawn(await_deletion(
            self.client.clone(),
            path.to_string(),
            watcher,
            tx,
        ));
        Ok(Some(rx))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete(path, None)
            .await
            .map_err(|e| coordination_error(path, e))
    }
}
