//! Atomic scripts backing the lease-based lock.
//!
//! The lock record is a hash stored under the lock name, mapping one holder
//! token to its reentrancy count. `KEYS[1]` is always the lock name and
//! `ARGV[1]` the holder token.

use warden_common::Result;
use warden_store::{Script, ScriptContext, ScriptValue, arg_at, arg_str, key_at};

/// Take or re-enter the lock; `ARGV[2]` is the lease in milliseconds.
///
/// Returns 1 when acquired, 0 when another holder owns it.
pub const ACQUIRE: Script = Script::new(
    "lease_lock_acquire",
    r#"
if (redis.call('exists', KEYS[1]) == 0) or (redis.call('hexists', KEYS[1], ARGV[1]) == 1) then
    redis.call('hincrby', KEYS[1], ARGV[1], 1)
    redis.call('pexpire', KEYS[1], ARGV[2])
    return 1
end
return 0
"#,
    acquire,
);

/// Refresh the lease if the holder still owns the lock; 1 on success
pub const RENEW: Script = Script::new(
    "lease_lock_renew",
    r#"
if redis.call('hexists', KEYS[1], ARGV[1]) == 1 then
    return redis.call('pexpire', KEYS[1], ARGV[2])
end
return 0
"#,
    renew,
);

/// Drop one level of ownership.
///
/// nil: not the owner. 0: still held (reentrant). 1: fully released.
pub const RELEASE: Script = Script::new(
    "lease_lock_release",
    r#"
if redis.call('hexists', KEYS[1], ARGV[1]) == 0 then
    return nil
end
local count = redis.call('hincrby', KEYS[1], ARGV[1], -1)
if count > 0 then
    return 0
end
redis.call('del', KEYS[1])
return 1
"#,
    release,
);

/// Reentrancy count of the holder, 0 when not held
pub const HOLD_COUNT: Script = Script::new(
    "lease_lock_hold_count",
    r#"
local count = redis.call('hget', KEYS[1], ARGV[1])
if count then
    return tonumber(count)
end
return 0
"#,
    hold_count,
);

/// Every script the lease-based lock evaluates
pub const LOCK_SCRIPTS: [Script; 4] = [ACQUIRE, RENEW, RELEASE, HOLD_COUNT];

fn acquire(ctx: &mut ScriptContext<'_>, keys: &[String], args: &[String]) -> Result<ScriptValue> {
    let key = key_at(keys, 0)?;
    let holder = arg_str(args, 0)?;
    let lease_ms: u64 = arg_at(args, 1)?;

    if ctx.exists(key) && !ctx.hexists(key, holder)? {
        return Ok(ScriptValue::Int(0));
    }
    ctx.hincr_by(key, holder, 1)?;
    ctx.pexpire(key, lease_ms);
    Ok(ScriptValue::Int(1))
}

fn renew(ctx: &mut ScriptContext<'_>, keys: &[String], args: &[String]) -> Result<ScriptValue> {
    let key = key_at(keys, 0)?;
    let holder = arg_str(args, 0)?;
    let lease_ms: u64 = arg_at(args, 1)?;

    if !ctx.hexists(key, holder)? {
        return Ok(ScriptValue::Int(0));
    }
    Ok(ScriptValue::from_bool(ctx.pexpire(key, lease_ms)))
}

fn release(ctx: &mut ScriptContext<'_>, keys: &[String], args: &[String]) -> Result<ScriptValue> {
    let key = key_at(keys, 0)?;
    let holder = arg_str(args, 0)?;

    if !ctx.hexists(key, holder)? {
        return Ok(ScriptValue::Nil);
    }
    if ctx.hincr_by(key, holder, -1)? > 0 {
        return Ok(ScriptValue::Int(0));
    }
    ctx.del(key);
    Ok(ScriptValue::Int(1))
}

fn hold_count(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    args: &[String],
) -> Result<ScriptValue> {
    let key = key_at(keys, 0)?;
    let holder = arg_str(args, 0)?;

    let count = match ctx.hget(key, holder)? {
        Some(raw) => raw.parse().unwrap_or(0),
        None => 0,
    };
    Ok(ScriptValue::Int(count))
}
