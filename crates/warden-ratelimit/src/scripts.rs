//! Atomic admission scripts, one per algorithm.
//!
//! The Lua bodies and the native evaluators apply the same transition as
//! [`crate::algorithm`]. All return 1 to admit and 0 to deny.

use warden_common::{BUCKET_STATE_TTL_MS, Result};
use warden_store::{Script, ScriptContext, ScriptValue, arg_at, arg_str, key_at};

use crate::algorithm::{
    HybridAdmission, LeakyState, TokenState, fixed_window, hybrid_bucket, leaky_bucket,
    sliding_window, token_bucket,
};

/// `KEYS[1]` counter; `ARGV` = limit, window_ms, now
pub const FIXED_WINDOW: Script = Script::new(
    "rate_limit_fixed_window",
    r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
if current > tonumber(ARGV[1]) then
    return 0
end
return 1
"#,
    fixed_window_native,
);

/// `KEYS[1]` sorted set; `ARGV` = now, limit, window_ms[, nonce]
pub const SLIDING_WINDOW: Script = Script::new(
    "rate_limit_sliding_window",
    r#"
local now = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local member = ARGV[1]
if ARGV[4] then
    member = ARGV[1] .. '-' .. ARGV[4]
end
redis.call('ZADD', KEYS[1], now, member)
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
redis.call('PEXPIRE', KEYS[1], window)
if redis.call('ZCARD', KEYS[1]) > limit then
    return 0
end
return 1
"#,
    sliding_window_native,
);

/// `KEYS[1]` hash {water, last}; `ARGV` = capacity, rate, now
pub const LEAKY_BUCKET: Script = Script::new(
    "rate_limit_leaky_bucket",
    r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local water = tonumber(redis.call('HGET', KEYS[1], 'water')) or 0
local last = tonumber(redis.call('HGET', KEYS[1], 'last')) or now
local leaked = math.floor(math.max(0, now - last) * rate / 1000)
water = math.max(0, water - leaked)
if water + 1 > capacity then
    return 0
end
redis.call('HSET', KEYS[1], 'water', water + 1, 'last', math.max(last, now))
redis.call('PEXPIRE', KEYS[1], 60000)
return 1
"#,
    leaky_bucket_native,
);

/// `KEYS[1]` hash {tokens, last}; `ARGV` = capacity, rate, now
pub const TOKEN_BUCKET: Script = Script::new(
    "rate_limit_token_bucket",
    r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens')) or capacity
local last = tonumber(redis.call('HGET', KEYS[1], 'last')) or now
local generated = math.floor(math.max(0, now - last) * rate / 1000)
tokens = math.min(capacity, tokens + generated)
if tokens < 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'tokens', tokens - 1, 'last', math.max(last, now))
redis.call('PEXPIRE', KEYS[1], 60000)
return 1
"#,
    token_bucket_native,
);

/// `KEYS[1]` token counter, `KEYS[2]` overflow list;
/// `ARGV` = token_limit, queue_limit, window_ms, now
pub const HYBRID_BUCKET: Script = Script::new(
    "rate_limit_hybrid_bucket",
    r#"
local token_limit = tonumber(ARGV[1])
local queue_limit = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local tokens = redis.call('INCR', KEYS[1])
if tokens == 1 then
    redis.call('PEXPIRE', KEYS[1], window)
end
if tokens <= token_limit then
    return 1
end
redis.call('DECR', KEYS[1])
if redis.call('LLEN', KEYS[2]) >= queue_limit then
    return 0
end
redis.call('RPUSH', KEYS[2], ARGV[4])
redis.call('PEXPIRE', KEYS[2], window)
return 1
"#,
    hybrid_bucket_native,
);

fn fixed_window_native(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    args: &[String],
) -> Result<ScriptValue> {
    let key = key_at(keys, 0)?;
    let limit: u64 = arg_at(args, 0)?;
    let window_ms: u64 = arg_at(args, 1)?;

    let current = ctx.incr(key)?;
    if current == 1 {
        ctx.pexpire(key, window_ms);
    }
    let decision = fixed_window((current - 1).max(0) as u64, limit);
    Ok(ScriptValue::from_bool(decision.admitted))
}

fn sliding_window_native(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    args: &[String],
) -> Result<ScriptValue> {
    let key = key_at(keys, 0)?;
    let now: i64 = arg_at(args, 0)?;
    let limit: u64 = arg_at(args, 1)?;
    let window_ms: u64 = arg_at(args, 2)?;
    let member = match args.get(3) {
        Some(_) => format!("{}-{}", now, arg_str(args, 3)?),
        None => now.to_string(),
    };

    let stamps = ctx.zscores(key)?;
    let decision = sliding_window(&stamps, now, window_ms, limit);

    let floor = now.saturating_sub(i64::try_from(window_ms).unwrap_or(i64::MAX));
    ctx.zadd(key, now, &member)?;
    ctx.zremrangebyscore(key, 0, floor)?;
    ctx.pexpire(key, window_ms);
    Ok(ScriptValue::from_bool(decision.admitted))
}

fn hash_u64(ctx: &mut ScriptContext<'_>, key: &str, field: &str) -> Result<Option<u64>> {
    Ok(ctx.hget(key, field)?.and_then(|raw| raw.parse().ok()))
}

fn leaky_bucket_native(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    args: &[String],
) -> Result<ScriptValue> {
    let key = key_at(keys, 0)?;
    let capacity: u64 = arg_at(args, 0)?;
    let rate: u64 = arg_at(args, 1)?;
    let now: u64 = arg_at(args, 2)?;

    let water = hash_u64(ctx, key, "water")?;
    let last = hash_u64(ctx, key, "last")?;
    let stored = (water.is_some() || last.is_some()).then(|| LeakyState {
        water: water.unwrap_or(0),
        last: last.unwrap_or(now),
    });

    let decision = leaky_bucket(stored, now, capacity, rate);
    let Some(next) = decision.state else {
        return Ok(ScriptValue::Int(0));
    };
    ctx.hset(key, "water", &next.water.to_string())?;
    ctx.hset(key, "last", &next.last.to_string())?;
    ctx.pexpire(key, BUCKET_STATE_TTL_MS);
    Ok(ScriptValue::Int(1))
}

fn token_bucket_native(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    args: &[String],
) -> Result<ScriptValue> {
    let key = key_at(keys, 0)?;
    let capacity: u64 = arg_at(args, 0)?;
    let rate: u64 = arg_at(args, 1)?;
    let now: u64 = arg_at(args, 2)?;

    let tokens = hash_u64(ctx, key, "tokens")?;
    let last = hash_u64(ctx, key, "last")?;
    let stored = (tokens.is_some() || last.is_some()).then(|| TokenState {
        tokens: tokens.unwrap_or(capacity),
        last: last.unwrap_or(now),
    });

    let decision = token_bucket(stored, now, capacity, rate);
    let Some(next) = decision.state else {
        return Ok(ScriptValue::Int(0));
    };
    ctx.hset(key, "tokens", &next.tokens.to_string())?;
    ctx.hset(key, "last", &next.last.to_string())?;
    ctx.pexpire(key, BUCKET_STATE_TTL_MS);
    Ok(ScriptValue::Int(1))
}

fn hybrid_bucket_native(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    args: &[String],
) -> Result<ScriptValue> {
    let token_key = key_at(keys, 0)?;
    let queue_key = key_at(keys, 1)?;
    let token_limit: u64 = arg_at(args, 0)?;
    let queue_limit: u64 = arg_at(args, 1)?;
    let window_ms: u64 = arg_at(args, 2)?;
    let now: u64 = arg_at(args, 3)?;

    let tokens = ctx.incr(token_key)?;
    if tokens == 1 {
        ctx.pexpire(token_key, window_ms);
    }
    let queued = ctx.llen(queue_key)? as u64;

    let admission = hybrid_bucket((tokens - 1).max(0) as u64, queued, token_limit, queue_limit);
    match admission {
        HybridAdmission::Token => {}
        HybridAdmission::Queued => {
            ctx.decr(token_key)?;
            ctx.rpush(queue_key, &now.to_string())?;
            ctx.pexpire(queue_key, window_ms);
        }
        HybridAdmission::Rejected => {
            ctx.decr(token_key)?;
        }
    }
    Ok(ScriptValue::from_bool(admission.is_admitted()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_store::{MemoryStore, ScriptExecutor};

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_hybrid_spills_into_queue() {
        let store = MemoryStore::new();
        let keys = strings(&["rate:hybrid:pay", "rate:hybrid:pay:queue"]);
        let args = strings(&["2", "1", "1000", "5"]);

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(store.execute(&HYBRID_BUCKET, &keys, &args).await.unwrap());
        }
        assert_eq!(
            results,
            vec![
                ScriptValue::Int(1),
                ScriptValue::Int(1),
                ScriptValue::Int(1),
                ScriptValue::Int(0)
            ]
        );
    }

    #[tokio::test]
    async fn test_sliding_window_distinct_members() {
        let store = MemoryStore::new();
        let keys = strings(&["rate:sliding:pay"]);

        let first = store
            .execute(&SLIDING_WINDOW, &keys, &strings(&["10", "1", "1000", "a"]))
            .await
            .unwrap();
        let second = store
            .execute(&SLIDING_WINDOW, &keys, &strings(&["10", "1", "1000", "b"]))
            .await
            .unwrap();
        assert_eq!(first, ScriptValue::Int(1));
        assert_eq!(second, ScriptValue::Int(0));
    }

    #[tokio::test]
    async fn test_sliding_window_wider_than_clock() {
        let store = MemoryStore::new();
        let keys = strings(&["rate:sliding:wide"]);
        let args = strings(&["5", "3", "9223372036854775808"]);

        let v = store.execute(&SLIDING_WINDOW, &keys, &args).await.unwrap();
        assert_eq!(v, ScriptValue::Int(1));
        let later = strings(&["6", "1", "9223372036854775808"]);
        let v = store.execute(&SLIDING_WINDOW, &keys, &later).await.unwrap();
        assert_eq!(v, ScriptValue::Int(0));
    }

    #[tokio::test]
    async fn test_missing_arguments_are_rejected() {
        let store = MemoryStore::new();
        let keys = strings(&["rate:token:pay"]);
        let err = store
            .execute(&TOKEN_BUCKET, &keys, &strings(&["5", "5"]))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
