//! Store and coordination backend selection.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;
use warden_common::Result;
use warden_lock::LOCK_SCRIPTS;
use warden_ratelimit::RateLimiterRegistry;
use warden_store::{
    CoordinationService, KvStore, MemoryCoordinator, MemoryStore, ScriptExecutor,
};

use crate::config::{CoordinationBackend, CoordinationOptions, StoreBackend, StoreOptions};

/// The store both locks and limiters run their scripts against
pub struct Backend {
    pub executor: Arc<dyn ScriptExecutor>,
    pub kv: Arc<dyn KvStore>,
    reaper: Option<JoinHandle<()>>,
}

impl Backend {
    pub async fn connect(options: &StoreOptions) -> Result<Self> {
        match options.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                let reaper = (options.reaper_interval_ms > 0).then(|| {
                    store.spawn_reaper(Duration::from_millis(options.reaper_interval_ms))
                });
                info!(
                    reaper_interval_ms = options.reaper_interval_ms,
                    "Using in-memory store"
                );
                let mut backend = Self::memory(store);
                backend.reaper = reaper;
                Ok(backend)
            }
            StoreBackend::Redis => Self::redis(&options.redis_url).await,
        }
    }

    /// Backend over an existing in-memory store, without a reaper
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            executor: store.clone(),
            kv: store,
            reaper: None,
        }
    }

    #[cfg(feature = "redis")]
    async fn redis(url: &str) -> Result<Self> {
        let store = Arc::new(warden_store::RedisStore::connect(url).await?);
        Ok(Self {
            executor: store.clone(),
            kv: store,
            reaper: None,
        })
    }

    #[cfg(not(feature = "redis"))]
    async fn redis(_url: &str) -> Result<Self> {
        Err(warden_common::WardenError::ConfigError(
            "redis backend requested but warden-server was built without the `redis` feature"
                .to_string(),
        ))
    }

    /// Register every lock and limiter script so a broken one fails at startup
    pub async fn load_scripts(&self, registry: &RateLimiterRegistry) -> Result<()> {
        self.executor.load(&LOCK_SCRIPTS).await?;
        let scripts = registry.scripts();
        self.executor.load(&scripts).await?;
        info!(
            count = LOCK_SCRIPTS.len() + scripts.len(),
            "Store scripts loaded"
        );
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

/// Hands out coordination sessions to queue-ordered locks.
///
/// Each session stands for one client process: its sequence nodes are
/// removed when it ends.
pub enum Coordination {
    /// Sessions on a tree shared only inside this process
    Memory(MemoryCoordinator),
    /// Sessions on a ZooKeeper ensemble
    ZooKeeper {
        connect: String,
        session_timeout: Duration,
    },
}

impl Coordination {
    pub fn memory() -> Self {
        Self::Memory(MemoryCoordinator::new())
    }

    pub fn from_options(options: &CoordinationOptions) -> Self {
        match options.backend {
            CoordinationBackend::Memory => {
                info!("Using in-memory coordination");
                Self::memory()
            }
            CoordinationBackend::Zookeeper => {
                info!(connect = %options.connect, "Using ZooKeeper coordination");
                Self::ZooKeeper {
                    connect: options.connect.clone(),
                    session_timeout: options.session_timeout(),
                }
            }
        }
    }

    /// Open a new session
    pub async fn session(&self) -> Result<Arc<dyn CoordinationService>> {
        match self {
            Self::Memory(coordinator) => Ok(Arc::new(coordinator.connect())),
            Self::ZooKeeper {
                connect,
                session_timeout,
            } => zookeeper_session(connect, *session_timeout).await,
        }
    }
}

#[cfg(feature = "zookeeper")]
async fn zookeeper_session(
    connect: &str,
    session_timeout: Duration,
) -> Result<Arc<dyn CoordinationService>> {
    let session = warden_store::ZooKeeperCoordinator::connect(connect, session_timeout).await?;
    Ok(Arc::new(session))
}

#[cfg(not(feature = "zookeeper"))]
async fn zookeeper_session(
    _connect: &str,
    _session_timeout: Duration,
) -> Result<Arc<dyn CoordinationService>> {
    Err(warden_common::WardenError::ConfigError(
        "zookeeper coordination requested but warden-server was built without the \
         `zookeeper` feature"
            .to_string(),
    ))
}
