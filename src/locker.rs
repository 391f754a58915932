//! Distributed mutual exclusion on the remote KV store.
//!
//! Locks are TTL-backed entries written with `SET NX PX` and a random
//! token; release and extend are compare-and-act Lua scripts so a lock that
//! expired and was re-obtained elsewhere can never be touched by its old
//! holder. Obtainment polls until the wait window closes.

use std::time::{Duration, Instant};

use redis::Script;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::storage::RedisPool;

const OBTAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end"#;

pub struct Locker {
    pool: RedisPool,
}

impl Locker {
    pub(crate) fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    /// Obtain `key` for `ttl`, polling for at most `wait`.
    pub async fn obtain(&self, key: &str, ttl: Duration, wait: Duration) -> Result<Lock> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        loop {
            let mut conn = self.pool.manager();
            let acquired: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
                debug!(key, "lock obtained");
                return Ok(Lock {
                    key: key.to_string(),
                    token,
                    pool: self.pool.clone(),
                });
            }
            if started.elapsed() >= wait {
                return Err(EngineError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(OBTAIN_POLL_INTERVAL).await;
        }
    }
}

/// A held lock. Dropping it without [`release`](Lock::release) leaves the
/// entry to expire on its own TTL.
pub struct Lock {
    key: String,
    token: String,
    pool: RedisPool,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock. `false` when it already expired and was lost.
    pub async fn release(self) -> Result<bool> {
        let mut conn = self.pool.manager();
        let released: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    /// Push the expiry out to `ttl` from now. `false` when the lock was
    /// already lost.
    pub async fn extend(&self, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.manager();
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }
}
