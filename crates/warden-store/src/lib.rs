//! Warden Store - atomic script execution and coordination backends
//!
//! This crate provides:
//! - The `ScriptExecutor` seam: named scripts evaluated atomically by a store
//! - `MemoryStore`: embedded store with Redis-like data types and expiry
//! - `RedisStore`: Redis backend (feature `redis`)
//! - The `CoordinationService` seam, an in-memory implementation and a
//!   ZooKeeper one (feature `zookeeper`)

pub mod coordination;
pub mod keyspace;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod script;

pub use coordination::{CoordinationService, CoordinatorSession, MemoryCoordinator, WatchEvent};
#[cfg(feature = "zookeeper")]
pub use coordination::ZooKeeperCoordinator;
pub use keyspace::{Keyspace, ScriptContext};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use script::{
    KvStore, NativeScript, Script, ScriptExecutor, ScriptValue, arg_at, arg_str, key_at,
};
