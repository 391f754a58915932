//! Remote KV pool over `redis::aio::ConnectionManager`.
//!
//! The engine needs a narrow surface: GET/MGET/SET/MSET/DEL for entity rows
//! and cached index results, sorted-set ops for the dirty-queue side
//! channels, and list ops for the lazy-write side channel. The connection
//! manager reconnects on its own; only the initial connect is retried here.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::Result;
use crate::retry::{retry, RetryConfig};

#[derive(Clone)]
pub struct RedisPool {
    code: String,
    manager: ConnectionManager,
}

impl RedisPool {
    pub(crate) async fn connect(code: &str, address: &str, db: i64) -> Result<Self> {
        let url = format!("redis://{}/{}", address, db);
        let client = redis::Client::open(url.as_str())?;
        let manager = retry("redis_connect", &RetryConfig::startup(), || {
            ConnectionManager::new(client.clone())
        })
        .await?;
        Ok(Self { code: code.to_string(), manager })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub(crate) fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        Ok(redis::cmd("MGET").arg(keys).query_async(&mut conn).await?)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        Ok(conn.set(key, value).await?)
    }

    pub async fn mset(&self, pairs: &[(String, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("MSET");
        for (key, value) in pairs {
            cmd.arg(key).arg(value);
        }
        Ok(cmd.query_async(&mut conn).await?)
    }

    pub async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        Ok(conn.del(keys).await?)
    }

    // sorted-set side channel (dirty queues, flush-in-cache reconcile set)

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.manager.clone();
        Ok(conn.zadd(key, member, score).await?)
    }

    pub async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(String, f64)>> {
        let mut conn = self.manager.clone();
        Ok(conn.zpopmin(key, count as isize).await?)
    }

    pub async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        Ok(conn.zcard(key).await?)
    }

    // list side channel (lazy write queue)

    pub async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        Ok(conn.rpush(key, value).await?)
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        Ok(conn.lpush(key, value).await?)
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.rpop(key, None).await?)
    }

    pub async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        Ok(conn.llen(key).await?)
    }
}
