//! Lease-based reentrant distributed lock.
//!
//! Ownership lives entirely in the store: a hash under the lock name maps
//! the holder token to its reentrancy count and the key carries the lease
//! as its expiry. While held, a [`RenewalTask`] keeps pushing the expiry
//! forward. If the holder process dies the renewals stop and the lock
//! frees itself within one lease.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_common::{
    DEFAULT_ACQUIRE_RETRY_INTERVAL, DEFAULT_LEASE, Result, WardenError,
};
use warden_store::{ScriptExecutor, ScriptValue};

use crate::renewal::RenewalTask;
use crate::scripts::{ACQUIRE, HOLD_COUNT, LOCK_SCRIPTS, RELEASE};

const KIND: &str = "lease";

/// Tuning of lease-based locks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseLockOptions {
    /// Lease applied on every acquire and renewal
    pub lease_ms: u64,
    /// Sleep between attempts while another holder owns the lock
    pub retry_interval_ms: u64,
}

impl Default for LeaseLockOptions {
    fn default() -> Self {
        Self {
            lease_ms: DEFAULT_LEASE.as_millis() as u64,
            retry_interval_ms: DEFAULT_ACQUIRE_RETRY_INTERVAL.as_millis() as u64,
        }
    }
}

impl LeaseLockOptions {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        // Renewal runs every third of the lease
        if self.lease_ms < 3 {
            return Err(WardenError::IllegalArgument(format!(
                "lease must be at least 3ms, got {}ms",
                self.lease_ms
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(WardenError::IllegalArgument(
                "retry interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hands out lease-based locks for one client instance.
///
/// Each handle gets its own holder token `<client-id>:<seq>`, so two
/// handles never share ownership even inside the same process.
pub struct LeaseLockClient {
    executor: Arc<dyn ScriptExecutor>,
    client_id: String,
    next_holder: AtomicU64,
    options: LeaseLockOptions,
}

impl LeaseLockClient {
    pub fn new(executor: Arc<dyn ScriptExecutor>, options: LeaseLockOptions) -> Result<Self> {
        options.validate()?;
        let client_id = Uuid::new_v4().to_string();
        info!(client_id = %client_id, lease_ms = options.lease_ms, "Lease lock client created");
        Ok(Self {
            executor,
            client_id,
            next_holder: AtomicU64::new(1),
            options,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn options(&self) -> &LeaseLockOptions {
        &self.options
    }

    /// Register the lock scripts with the store so broken ones fail now
    pub async fn load_scripts(&self) -> Result<()> {
        self.executor.load(&LOCK_SCRIPTS).await
    }

    pub fn lease_lock(&self, name: impl Into<String>) -> LeaseLock {
        let seq = self.next_holder.fetch_add(1, Ordering::Relaxed);
        let holder = format!("{}:{}", self.client_id, seq);
        self.lease_lock_with_holder(name, holder)
    }

    /// Lock handle acting for a caller-chosen logical holder
    pub fn lease_lock_with_holder(
        &self,
        name: impl Into<String>,
        holder: impl Into<String>,
    ) -> LeaseLock {
        LeaseLock {
            executor: self.executor.clone(),
            name: name.into(),
            holder: holder.into(),
            options: self.options.clone(),
            renewal: None,
        }
    }
}

/// Handle on one named lease-based lock for one holder.
///
/// Reentrant: every successful `lock` needs a matching `unlock`. Dropping
/// the handle stops lease renewal but does not release the lock, which
/// then expires after one lease.
///
/// Acquiring and releasing take `&mut self`: ownership belongs to the holder
/// token, so tasks that must exclude each other each need their own handle.
pub struct LeaseLock {
    executor: Arc<dyn ScriptExecutor>,
    name: String,
    holder: String,
    options: LeaseLockOptions,
    renewal: Option<RenewalTask>,
}

impl LeaseLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder_token(&self) -> &str {
        &self.holder
    }

    fn keys(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    /// One acquisition attempt
    pub async fn try_lock(&mut self) -> Result<bool> {
        let args = vec![self.holder.clone(), self.options.lease_ms.to_string()];
        let acquired = self
            .executor
            .execute(&ACQUIRE, &self.keys(), &args)
            .await?
            .as_bool();

        if acquired {
            self.ensure_renewal();
            metrics::counter!("warden_lock_acquired_total", "kind" => KIND).increment(1);
            debug!(lock = %self.name, holder = %self.holder, "Lock acquired");
        }
        Ok(acquired)
    }

    /// Block until the lock is held.
    ///
    /// Retries at a fixed interval for as long as it takes. Transient store
    /// errors are logged and retried the same way.
    pub async fn lock(&mut self) -> Result<()> {
        loop {
            if self.attempt().await? {
                return Ok(());
            }
            tokio::time::sleep(self.options.retry_interval()).await;
        }
    }

    /// Like [`lock`](Self::lock) but gives up after `wait`.
    ///
    /// Returns `Ok(false)` on timeout.
    pub async fn try_lock_for(&mut self, wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + wait;
        loop {
            if self.attempt().await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(lock = %self.name, holder = %self.holder, "Gave up waiting for lock");
                return Ok(false);
            }
            let pause = self.options.retry_interval().min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// `try_lock` that treats a transient failure as "not yet"
    async fn attempt(&mut self) -> Result<bool> {
        match self.try_lock().await {
            Ok(true) => Ok(true),
            Ok(false) => {
                metrics::counter!("warden_lock_retry_total", "kind" => KIND).increment(1);
                Ok(false)
            }
            Err(e) if e.is_transient() => {
                metrics::counter!("warden_lock_retry_total", "kind" => KIND).increment(1);
                warn!(lock = %self.name, error = %e, "Lock acquisition failed, retrying");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Release one level of ownership.
    ///
    /// Fails with [`WardenError::NotOwner`] when this holder does not own
    /// the lock (never acquired, already released, or lease expired).
    pub async fn unlock(&mut self) -> Result<()> {
        let args = vec![self.holder.clone()];
        match self.executor.execute(&RELEASE, &self.keys(), &args).await? {
            ScriptValue::Nil => Err(WardenError::NotOwner {
                lock: self.name.clone(),
                holder: self.holder.clone(),
            }),
            ScriptValue::Int(1) => {
                if let Some(task) = self.renewal.take() {
                    task.stop();
                }
                metrics::counter!("warden_lock_released_total", "kind" => KIND).increment(1);
                debug!(lock = %self.name, holder = %self.holder, "Lock released");
                Ok(())
            }
            ScriptValue::Int(_) => {
                debug!(
                    lock = %self.name,
                    holder = %self.holder,
                    "Lock still held after reentrant unlock"
                );
                Ok(())
            }
        }
    }

    /// Reentrancy count of this holder as recorded in the store
    pub async fn hold_count(&self) -> Result<u32> {
        let args = vec![self.holder.clone()];
        let value = self
            .executor
            .execute(&HOLD_COUNT, &self.keys(), &args)
            .await?;
        Ok(value.as_int().unwrap_or(0).max(0) as u32)
    }

    pub async fn is_held_by_me(&self) -> Result<bool> {
        Ok(self.hold_count().await? > 0)
    }

    fn ensure_renewal(&mut self) {
        if self.renewal.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        self.renewal = Some(RenewalTask::start(
            self.executor.clone(),
            self.name.clone(),
            self.holder.clone(),
            self.options.lease(),
        ));
    }
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_store::{KvStore, MemoryStore};

    fn client(store: Arc<MemoryStore>) -> LeaseLockClient {
        LeaseLockClient::new(store, LeaseLockOptions::default()).unwrap()
    }

    #[test]
    fn test_options_defaults_and_validation() {
        let options = LeaseLockOptions::default();
        assert_eq!(options.lease(), Duration::from_secs(30));
        assert_eq!(options.retry_interval(), Duration::from_millis(50));
        assert!(options.validate().is_ok());

        let bad = LeaseLockOptions {
            lease_ms: 2,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(WardenError::IllegalArgument(_))));

        let parsed: LeaseLockOptions =
            serde_json::from_str(r#"{"lease_ms": 9000}"#).unwrap();
        assert_eq!(parsed.lease_ms, 9000);
        assert_eq!(parsed.retry_interval_ms, 50);
    }

    #[test]
    fn test_holder_tokens_are_distinct() {
        let client = client(Arc::new(MemoryStore::new()));
        let a = client.lease_lock("stock");
        let b = client.lease_lock("stock");

        assert_ne!(a.holder_token(), b.holder_token());
        assert!(a.holder_token().starts_with(client.client_id()));
        let c = client.lease_lock_with_holder("stock", "order-service");
        assert_eq!(c.holder_token(), "order-service");
    }

    #[tokio::test]
    async fn test_reentrant_lock_and_unlock() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store.clone());
        let mut lock = client.lease_lock("stock");

        lock.lock().await.unwrap();
        lock.lock().await.unwrap();
        assert_eq!(lock.hold_count().await.unwrap(), 2);

        lock.unlock().await.unwrap();
        assert!(lock.is_held_by_me().await.unwrap());
        lock.unlock().await.unwrap();
        assert!(!lock.is_held_by_me().await.unwrap());
        assert!(!store.exists("stock").await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_without_ownership() {
        let client = client(Arc::new(MemoryStore::new()));
        let mut owner = client.lease_lock("stock");
        let mut other = client.lease_lock("stock");

        assert!(matches!(
            other.unlock().await,
            Err(WardenError::NotOwner { .. })
        ));

        owner.lock().await.unwrap();
        assert!(!other.try_lock().await.unwrap());
        let err = other.unlock().await.unwrap_err();
        assert!(!err.is_transient());
        owner.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_try_lock_for_times_out() {
        let client = client(Arc::new(MemoryStore::new()));
        let mut owner = client.lease_lock("stock");
        let mut waiter = client.lease_lock("stock");

        owner.lock().await.unwrap();
        let started = Instant::now();
        assert!(!waiter.try_lock_for(Duration::from_millis(120)).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(120));

        owner.unlock().await.unwrap();
        assert!(waiter.try_lock_for(Duration::from_millis(120)).await.unwrap());
        waiter.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_retries_through_transient_errors() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store.clone());
        let mut lock = client.lease_lock("stock");

        store.inject_failures(3);
        lock.lock().await.unwrap();
        assert!(lock.is_held_by_me().await.unwrap());

        store.inject_failures(1);
        let err = lock.unlock().await.unwrap_err();
        assert!(err.is_transient());
        lock.unlock().await.unwrap();
    }
}
