//! Atomic script model and the store seams.
//!
//! A [`Script`] carries two renditions of the same read-modify-write step:
//! the Lua source a Redis server evaluates, and a native evaluator the
//! embedded [`MemoryStore`](crate::MemoryStore) runs against its keyspace.
//! Either way the whole step is applied without interleaving from other
//! callers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use warden_common::{Result, WardenError};

use crate::keyspace::ScriptContext;

/// Native evaluator of a script, run while the keyspace is exclusively held
pub type NativeScript =
    fn(&mut ScriptContext<'_>, &[String], &[String]) -> Result<ScriptValue>;

/// Reply of a script evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptValue {
    /// Lua `nil` (and `false`, which Redis converts to nil)
    Nil,
    Int(i64),
}

impl ScriptValue {
    pub fn from_bool(value: bool) -> Self {
        Self::Int(value as i64)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Nil => None,
        }
    }

    /// `1` (or any non-zero integer) is true, `0` and nil are false
    pub fn as_bool(&self) -> bool {
        matches!(self, Self::Int(v) if *v != 0)
    }
}

impl From<Option<i64>> for ScriptValue {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Self::Nil, Self::Int)
    }
}

/// A named atomic script
#[derive(Clone, Copy)]
pub struct Script {
    id: &'static str,
    lua: &'static str,
    native: NativeScript,
}

impl Script {
    pub const fn new(id: &'static str, lua: &'static str, native: NativeScript) -> Self {
        Self { id, lua, native }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn lua(&self) -> &'static str {
        self.lua
    }

    pub(crate) fn native(&self) -> NativeScript {
        self.native
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("id", &self.id).finish()
    }
}

/// Executes scripts atomically against an external store
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Evaluate `script` over the ordered `keys` and `args`.
    ///
    /// Connection failures surface as [`WardenError::StoreUnavailable`].
    async fn execute(&self, script: &Script, keys: &[String], args: &[String])
    -> Result<ScriptValue>;

    /// Register scripts up front so a malformed one fails at startup
    /// with [`WardenError::InvalidScript`] rather than on first use.
    async fn load(&self, scripts: &[Script]) -> Result<()>;
}

/// Plain key/value commands used for inspection and by simple callers
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining time to live; `None` when the key is missing or has no expiry
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

/// `KEYS[index]`, failing like a script would on a missing key
pub fn key_at(keys: &[String], index: usize) -> Result<&str> {
    keys.get(index).map(String::as_str).ok_or_else(|| {
        WardenError::IllegalArgument(format!("missing KEYS[{}]", index + 1))
    })
}

/// `tonumber(ARGV[index])`, failing on a missing or non-numeric argument
pub fn arg_at<T: FromStr>(args: &[String], index: usize) -> Result<T> {
    let raw = args.get(index).ok_or_else(|| {
        WardenError::IllegalArgument(format!("missing ARGV[{}]", index + 1))
    })?;
    raw.trim().parse().map_err(|_| {
        WardenError::IllegalArgument(format!("ARGV[{}] is not a number: '{}'", index + 1, raw))
    })
}

/// `ARGV[index]` as the exact bytes the caller sent, for tokens and members
pub fn arg_str(args: &[String], index: usize) -> Result<&str> {
    args.get(index).map(String::as_str).ok_or_else(|| {
        WardenError::IllegalArgument(format!("missing ARGV[{}]", index + 1))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_value_conversions() {
        assert!(ScriptValue::Int(1).as_bool());
        assert!(!ScriptValue::Int(0).as_bool());
        assert!(!ScriptValue::Nil.as_bool());
        assert!(ScriptValue::Nil.is_nil());

        assert_eq!(ScriptValue::from(Some(7)), ScriptValue::Int(7));
        assert_eq!(ScriptValue::from(None), ScriptValue::Nil);
        assert_eq!(ScriptValue::from_bool(true), ScriptValue::Int(1));
        assert_eq!(ScriptValue::Int(42).as_int(), Some(42));
    }

    #[test]
    fn test_arg_parsing() {
        let args = vec!["10".to_string(), " 250 ".to_string(), "abc".to_string()];

        assert_eq!(arg_at::<u64>(&args, 0).unwrap(), 10);
        assert_eq!(arg_at::<u64>(&args, 1).unwrap(), 250);
        assert!(matches!(
            arg_at::<u64>(&args, 2),
            Err(WardenError::IllegalArgument(_))
        ));
        assert!(matches!(
            arg_at::<u64>(&args, 3),
            Err(WardenError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_string_args_are_not_trimmed() {
        let args = vec!["svc".to_string(), " svc".to_string()];

        assert_eq!(arg_str(&args, 0).unwrap(), "svc");
        assert_eq!(arg_str(&args, 1).unwrap(), " svc");
        assert!(matches!(
            arg_str(&args, 2),
            Err(WardenError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_key_lookup() {
        let keys = vec!["rate:fixed:a".to_string()];
        assert_eq!(key_at(&keys, 0).unwrap(), "rate:fixed:a");
        assert!(key_at(&keys, 1).is_err());
    }
}
