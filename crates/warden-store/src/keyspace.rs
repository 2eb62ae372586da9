//! Redis-like keyspace backing the embedded store.
//!
//! Supports the value types the atomic scripts touch (counters/strings,
//! hashes, sorted sets, lists) with per-key millisecond expiry. Expired keys
//! are dropped lazily on access and in bulk by [`Keyspace::purge_expired`].

use std::collections::{BTreeSet, HashMap, VecDeque};

use warden_common::{Result, WardenError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(SortedSet),
    List(VecDeque<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::ZSet(_) => "zset",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SortedSet {
    by_member: HashMap<String, i64>,
    by_score: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &str) -> bool {
        let added = match self.by_member.insert(member.to_string(), score) {
            Some(old) => {
                self.by_score.remove(&(old, member.to_string()));
                false
            }
            None => true,
        };
        self.by_score.insert((score, member.to_string()));
        added
    }

    fn remove_range(&mut self, min: i64, max: i64) -> usize {
        let doomed: Vec<(i64, String)> = self
            .by_score
            .iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .cloned()
            .collect();
        for (score, member) in &doomed {
            self.by_score.remove(&(*score, member.clone()));
            self.by_member.remove(member);
        }
        doomed.len()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expire_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expire_at.is_some_and(|at| now >= at)
    }
}

/// In-memory keyspace
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key whose expiry is at or before `now`; returns how many went
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Number of live keys at `now`
    pub fn len(&self, now: u64) -> usize {
        self.entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self, now: u64) -> bool {
        self.len(now) == 0
    }

    /// Command view over the keyspace frozen at time `now`
    pub fn context(&mut self, now: u64) -> ScriptContext<'_> {
        ScriptContext {
            keyspace: self,
            now,
        }
    }
}

/// Redis command surface available to native scripts.
///
/// Every command first evicts the key it touches if that key has expired,
/// so scripts never observe stale state.
pub struct ScriptContext<'a> {
    keyspace: &'a mut Keyspace,
    now: u64,
}

impl ScriptContext<'_> {
    /// Store time at which this evaluation runs
    pub fn now_millis(&self) -> u64 {
        self.now
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = self.now;
        if self
            .keyspace
            .entries
            .get(key)
            .is_some_and(|e| e.is_expired(now))
        {
            self.keyspace.entries.remove(key);
        }
        self.keyspace.entries.get_mut(key)
    }

    fn wrong_type(key: &str, found: &Value) -> WardenError {
        WardenError::IllegalArgument(format!(
            "WRONGTYPE operation against key '{}' holding a {}",
            key,
            found.type_name()
        ))
    }

    fn entry_or_insert(&mut self, key: &str, empty: Value) -> &mut Entry {
        let now = self.now;
        if self
            .keyspace
            .entries
            .get(key)
            .is_some_and(|e| e.is_expired(now))
        {
            self.keyspace.entries.remove(key);
        }
        self.keyspace
            .entries
            .entry(key.to_string())
            .or_insert(Entry {
                value: empty,
                expire_at: None,
            })
    }

    // --- generic ---

    pub fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    pub fn del(&mut self, key: &str) -> i64 {
        match self.live(key) {
            Some(_) => {
                self.keyspace.entries.remove(key);
                1
            }
            None => 0,
        }
    }

    /// Set a relative expiry; returns false when the key does not exist
    pub fn pexpire(&mut self, key: &str, millis: u64) -> bool {
        let at = self.now.saturating_add(millis);
        match self.live(key) {
            Some(entry) => {
                entry.expire_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Remaining milliseconds; `-2` for a missing key, `-1` for no expiry
    pub fn pttl(&mut self, key: &str) -> i64 {
        let now = self.now;
        match self.live(key) {
            Some(Entry {
                expire_at: Some(at),
                ..
            }) => at.saturating_sub(now) as i64,
            Some(_) => -1,
            None => -2,
        }
    }

    // --- strings / counters ---

    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(entry) => Err(Self::wrong_type(key, &entry.value)),
            None => Ok(None),
        }
    }

    /// Overwrite a string value, clearing any previous expiry
    pub fn set(&mut self, key: &str, value: &str, ttl_millis: Option<u64>) {
        let expire_at = ttl_millis.map(|ms| self.now.saturating_add(ms));
        self.keyspace.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expire_at,
            },
        );
    }

    /// Add `delta` to an integer counter, creating it at 0; keeps the expiry
    pub fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        let entry = self.entry_or_insert(key, Value::Str("0".to_string()));
        match &mut entry.value {
            Value::Str(s) => {
                let current: i64 = s.parse().map_err(|_| {
                    WardenError::IllegalArgument(format!(
                        "value at '{}' is not an integer",
                        key
                    ))
                })?;
                let next = current + delta;
                *s = next.to_string();
                Ok(next)
            }
            other => Err(Self::wrong_type(key, other)),
        }
    }

    pub fn incr(&mut self, key: &str) -> Result<i64> {
        self.incr_by(key, 1)
    }

    pub fn decr(&mut self, key: &str) -> Result<i64> {
        self.incr_by(key, -1)
    }

    // --- hashes ---

    pub fn hexists(&mut self, key: &str, field: &str) -> Result<bool> {
        match self.live(key) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.contains_key(field)),
            Some(entry) => Err(Self::wrong_type(key, &entry.value)),
            None => Ok(false),
        }
    }

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        match self.live(key) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            Some(entry) => Err(Self::wrong_type(key, &entry.value)),
            None => Ok(None),
        }
    }

    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        let entry = self.entry_or_insert(key, Value::Hash(HashMap::new()));
        match &mut entry.value {
            Value::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            other => Err(Self::wrong_type(key, other)),
        }
    }

    pub fn hincr_by(&mut self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let entry = self.entry_or_insert(key, Value::Hash(HashMap::new()));
        match &mut entry.value {
            Value::Hash(h) => {
                let slot = h.entry(field.to_string()).or_insert_with(|| "0".to_string());
                let current: i64 = slot.parse().map_err(|_| {
                    WardenError::IllegalArgument(format!(
                        "hash value at '{}'.'{}' is not an integer",
                        key, field
                    ))
                })?;
                let next = current + delta;
                *slot = next.to_string();
                Ok(next)
            }
            other => Err(Self::wrong_type(key, other)),
        }
    }

    // --- sorted sets ---

    /// Add or rescore a member; returns true when the member is new
    pub fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<bool> {
        let entry = self.entry_or_insert(key, Value::ZSet(SortedSet::default()));
        match &mut entry.value {
            Value::ZSet(z) => Ok(z.insert(score, member)),
            other => Err(Self::wrong_type(key, other)),
        }
    }

    /// Remove members with `min <= score <= max`; an emptied set is deleted
    pub fn zremrangebyscore(&mut self, key: &str, min: i64, max: i64) -> Result<usize> {
        let (removed, emptied) = match self.live(key) {
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => {
                let removed = z.remove_range(min, max);
                (removed, z.by_member.is_empty())
            }
            Some(entry) => return Err(Self::wrong_type(key, &entry.value)),
            None => return Ok(0),
        };
        if emptied {
            self.keyspace.entries.remove(key);
        }
        Ok(removed)
    }

    pub fn zcard(&mut self, key: &str) -> Result<usize> {
        match self.live(key) {
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(z.by_member.len()),
            Some(entry) => Err(Self::wrong_type(key, &entry.value)),
            None => Ok(0),
        }
    }

    /// All scores in ascending order
    pub fn zscores(&mut self, key: &str) -> Result<Vec<i64>> {
        match self.live(key) {
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(z.by_score.iter().map(|(score, _)| *score).collect()),
            Some(entry) => Err(Self::wrong_type(key, &entry.value)),
            None => Ok(Vec::new()),
        }
    }

    // --- lists ---

    pub fn llen(&mut self, key: &str) -> Result<usize> {
        match self.live(key) {
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(l.len()),
            Some(entry) => Err(Self::wrong_type(key, &entry.value)),
            None => Ok(0),
        }
    }

    /// Append to the tail; returns the new length
    pub fn rpush(&mut self, key: &str, value: &str) -> Result<usize> {
        let entry = self.entry_or_insert(key, Value::List(VecDeque::new()));
        match &mut entry.value {
            Value::List(l) => {
                l.push_back(value.to_string());
                Ok(l.len())
            }
            other => Err(Self::wrong_type(key, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_keeps_expiry() {
        let mut ks = Keyspace::new();
        let mut ctx = ks.context(0);

        assert_eq!(ctx.incr("c").unwrap(), 1);
        assert!(ctx.pexpire("c", 1000));
        assert_eq!(ctx.incr("c").unwrap(), 2);
        assert_eq!(ctx.pttl("c"), 1000);
        assert_eq!(ctx.decr("c").unwrap(), 1);

        let mut later = ks.context(1000);
        assert!(!later.exists("c"));
        assert_eq!(later.incr("c").unwrap(), 1);
        assert_eq!(later.pttl("c"), -1);
    }

    #[test]
    fn test_hash_commands() {
        let mut ks = Keyspace::new();
        let mut ctx = ks.context(10);

        assert!(!ctx.hexists("lock", "a").unwrap());
        assert_eq!(ctx.hincr_by("lock", "a", 1).unwrap(), 1);
        assert_eq!(ctx.hincr_by("lock", "a", 1).unwrap(), 2);
        assert!(ctx.hexists("lock", "a").unwrap());
        assert_eq!(ctx.hget("lock", "a").unwrap().as_deref(), Some("2"));

        ctx.hset("lock", "b", "x").unwrap();
        assert_eq!(ctx.del("lock"), 1);
        assert_eq!(ctx.del("lock"), 0);
    }

    #[test]
    fn test_sorted_set_range_removal() {
        let mut ks = Keyspace::new();
        let mut ctx = ks.context(0);

        ctx.zadd("w", 100, "100-a").unwrap();
        ctx.zadd("w", 200, "200-a").unwrap();
        ctx.zadd("w", 200, "200-b").unwrap();
        assert_eq!(ctx.zcard("w").unwrap(), 3);
        assert_eq!(ctx.zscores("w").unwrap(), vec![100, 200, 200]);

        assert_eq!(ctx.zremrangebyscore("w", 0, 100).unwrap(), 1);
        assert_eq!(ctx.zcard("w").unwrap(), 2);

        assert_eq!(ctx.zremrangebyscore("w", 0, 500).unwrap(), 2);
        assert!(!ctx.exists("w"));
    }

    #[test]
    fn test_zadd_rescores_existing_member() {
        let mut ks = Keyspace::new();
        let mut ctx = ks.context(0);

        assert!(ctx.zadd("w", 1, "m").unwrap());
        assert!(!ctx.zadd("w", 5, "m").unwrap());
        assert_eq!(ctx.zscores("w").unwrap(), vec![5]);
    }

    #[test]
    fn test_list_commands() {
        let mut ks = Keyspace::new();
        let mut ctx = ks.context(0);

        assert_eq!(ctx.llen("q").unwrap(), 0);
        assert_eq!(ctx.rpush("q", "1").unwrap(), 1);
        assert_eq!(ctx.rpush("q", "2").unwrap(), 2);
        assert_eq!(ctx.llen("q").unwrap(), 2);
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let mut ks = Keyspace::new();
        let mut ctx = ks.context(0);

        ctx.set("s", "v", None);
        assert!(ctx.hincr_by("s", "f", 1).is_err());
        assert!(ctx.rpush("s", "x").is_err());
        assert!(ctx.zcard("s").is_err());
    }

    #[test]
    fn test_purge_expired() {
        let mut ks = Keyspace::new();
        {
            let mut ctx = ks.context(0);
            ctx.set("a", "1", Some(50));
            ctx.set("b", "1", Some(500));
            ctx.set("c", "1", None);
        }
        assert_eq!(ks.len(0), 3);
        assert_eq!(ks.purge_expired(100), 1);
        assert_eq!(ks.len(100), 2);
        assert_eq!(ks.purge_expired(1000), 1);
        assert!(!ks.is_empty(1000));
    }
}
