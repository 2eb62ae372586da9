//! Redis-backed store.
//!
//! Scripts run server-side with `EVALSHA` (falling back to `EVAL` when the
//! server has not cached the body yet), so Redis itself provides the
//! atomicity guarantee.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tracing::{debug, info};
use warden_common::{Result, WardenError};

use crate::script::{KvStore, Script, ScriptExecutor, ScriptValue};

/// Store client over a managed, auto-reconnecting Redis connection
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    scripts: DashMap<&'static str, redis::Script>,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| WardenError::ConfigError(format!("invalid redis url '{}': {}", url, e)))?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        info!(url = %url, "Connected to redis");
        Ok(Self {
            conn,
            scripts: DashMap::new(),
        })
    }

    fn prepared(&self, script: &Script) -> redis::Script {
        self.scripts
            .entry(script.id())
            .or_insert_with(|| redis::Script::new(script.lua()))
            .clone()
    }
}

fn store_error(e: redis::RedisError) -> WardenError {
    WardenError::StoreUnavailable(e.to_string())
}

fn script_error(id: &str, e: redis::RedisError) -> WardenError {
    if e.kind() == redis::ErrorKind::ResponseError {
        WardenError::InvalidScript {
            id: id.to_string(),
            reason: e.to_string(),
        }
    } else {
        store_error(e)
    }
}

#[async_trait]
impl ScriptExecutor for RedisStore {
    async fn execute(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue> {
        let prepared = self.prepared(script);
        let mut invocation = prepared.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let mut conn = self.conn.clone();
        let reply: Option<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_error(script.id(), e))?;
        Ok(reply.into())
    }

    async fn load(&self, scripts: &[Script]) -> Result<()> {
        let mut conn = self.conn.clone();
        for script in scripts {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(script.lua())
                .query_async(&mut conn)
                .await
                .map_err(|e| script_error(script.id(), e))?;
            debug!(script = script.id(), sha = %sha, "Loaded script");
            self.prepared(script);
        }
        info!(count = scripts.len(), "Scripts loaded into redis");
        Ok(())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(store_error)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(n > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok((pttl >= 0).then(|| Duration::from_millis(pttl as u64)))
    }
}
