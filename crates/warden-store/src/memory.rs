//! Embedded single-process store.
//!
//! Every script evaluation holds the keyspace mutex for its whole duration,
//! which is what makes a script indivisible relative to all other callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use warden_common::{Clock, Result, SystemClock, WardenError};

use crate::keyspace::Keyspace;
use crate::script::{KvStore, Script, ScriptExecutor, ScriptValue};

/// In-memory store with Redis-like semantics and millisecond expiry
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
    /// Pending simulated connection failures
    failures: AtomicU32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::new()),
            clock,
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` commands fail with a transient store error
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let taken = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(WardenError::StoreUnavailable(
                "simulated connection failure".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    /// Drop all expired keys now; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.keyspace.lock().purge_expired(now)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.keyspace.lock().len(now)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a background task that purges expired keys every `interval`
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(count = removed, "Purged expired keys");
                }
            }
        })
    }
}

#[async_trait]
impl ScriptExecutor for MemoryStore {
    async fn execute(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.lock();
        let mut ctx = keyspace.context(now);
        (script.native())(&mut ctx, keys, args)
    }

    async fn load(&self, scripts: &[Script]) -> Result<()> {
        for script in scripts {
            if script.lua().trim().is_empty() {
                return Err(WardenError::InvalidScript {
                    id: script.id().to_string(),
                    reason: "empty script body".to_string(),
                });
            }
        }
        debug!(count = scripts.len(), "Registered scripts with memory store");
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = self.clock.now_millis();
        self.keyspace.lock().context(now).get(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        let now = self.clock.now_millis();
        self.keyspace
            .lock()
            .context(now)
            .set(key, value, ttl.map(|d| d.as_millis() as u64));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now_millis();
        Ok(self.keyspace.lock().context(now).del(key) == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now_millis();
        Ok(self.keyspace.lock().context(now).exists(key))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let pttl = self.keyspace.lock().context(now).pttl(key);
        Ok((pttl >= 0).then(|| Duration::from_millis(pttl as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::ScriptContext;
    use crate::script::{arg_at, key_at};
    use warden_common::ManualClock;

    fn incr_with_ttl(
        ctx: &mut ScriptContext<'_>,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue> {
        let key = key_at(keys, 0)?;
        let ttl: u64 = arg_at(args, 0)?;
        let n = ctx.incr(key)?;
        if n == 1 {
            ctx.pexpire(key, ttl);
        }
        Ok(ScriptValue::Int(n))
    }

    const INCR_WITH_TTL: Script = Script::new(
        "test_incr_with_ttl",
        r#"
local n = redis.call('INCR', KEYS[1])
if n == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return n
"#,
        incr_with_ttl,
    );

    #[tokio::test]
    async fn test_execute_and_expire() {
        let clock = ManualClock::new(0);
        let store = MemoryStore::with_clock(clock.clone());
        let keys = vec!["counter".to_string()];
        let args = vec!["100".to_string()];

        for expected in 1..=3 {
            let v = store.execute(&INCR_WITH_TTL, &keys, &args).await.unwrap();
            assert_eq!(v, ScriptValue::Int(expected));
        }
        assert_eq!(
            store.ttl("counter").await.unwrap(),
            Some(Duration::from_millis(100))
        );

        clock.advance(100);
        assert!(!store.exists("counter").await.unwrap());
        let v = store.execute(&INCR_WITH_TTL, &keys, &args).await.unwrap();
        assert_eq!(v, ScriptValue::Int(1));
    }

    #[tokio::test]
    async fn test_kv_commands() {
        let store = MemoryStore::new();

        assert_eq!(store.get("stock").await.unwrap(), None);
        store.set("stock", "5000", None).await.unwrap();
        assert_eq!(store.get("stock").await.unwrap().as_deref(), Some("5000"));
        assert_eq!(store.ttl("stock").await.unwrap(), None);

        assert!(store.del("stock").await.unwrap());
        assert!(!store.del("stock").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.inject_failures(2);

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.exists("k").await.is_err());
        assert!(store.exists("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_load_rejects_empty_script() {
        fn noop(_: &mut ScriptContext<'_>, _: &[String], _: &[String]) -> Result<ScriptValue> {
            Ok(ScriptValue::Nil)
        }
        let bad = Script::new("broken", "   ", noop);
        let store = MemoryStore::new();

        let err = store.load(&[INCR_WITH_TTL, bad]).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidScript { id, .. } if id == "broken"));
    }

    #[tokio::test]
    async fn test_purge_and_reaper() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        store
            .set("a", "1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.set("b", "1", None).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(10);
        let handle = store.spawn_reaper(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(), 0);
        handle.abort();
    }
}
