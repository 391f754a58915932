//! Lazy write-behind queue.
//!
//! A flush in lazy mode serializes its SQL statements and cache deletions
//! into one payload and pushes it onto the remote-KV list `lazy_queue`
//! instead of applying them synchronously. The receiver pops one payload,
//! replays SQL in order, then replays cache deletions. Failed elements (and
//! the not-yet-attempted remainder) are re-serialized into a fresh payload
//! and re-enqueued; successful elements are never retried — the statements
//! themselves are not idempotent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::error::Result;

/// List key holding serialized payloads on the lazy queue's redis pool.
pub const LAZY_QUEUE_KEY: &str = "lazy_queue";

/// One deferred statement: `[pool_code, sql, params]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LazyQuery(pub String, pub String, pub Vec<Option<String>>);

/// Wire payload of one lazy flush.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LazyPayload {
    /// Ordered statements.
    #[serde(rename = "q", default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<LazyQuery>,
    /// Local cache pool -> keys to delete.
    #[serde(rename = "cl", default, skip_serializing_if = "HashMap::is_empty")]
    pub local_deletes: HashMap<String, Vec<String>>,
    /// Remote cache pool -> keys to delete.
    #[serde(rename = "cr", default, skip_serializing_if = "HashMap::is_empty")]
    pub redis_deletes: HashMap<String, Vec<String>>,
}

impl LazyPayload {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.local_deletes.is_empty() && self.redis_deletes.is_empty()
    }
}

/// Pops lazy payloads and replays them.
#[derive(Debug, Default)]
pub struct LazyReceiver;

impl LazyReceiver {
    pub fn new() -> Self {
        Self
    }

    pub async fn size(&self, engine: &Engine) -> Result<u64> {
        engine.lazy_queue_redis()?.llen(LAZY_QUEUE_KEY).await
    }

    /// Pop and replay one payload. Returns `false` when the queue is empty.
    ///
    /// On failure the broken remainder is re-enqueued before the error is
    /// returned, so a crashed digest never loses work (at-least-once).
    #[tracing::instrument(skip_all)]
    pub async fn digest(&self, engine: &Engine) -> Result<bool> {
        let queue = engine.lazy_queue_redis()?;
        let Some(raw) = queue.rpop(LAZY_QUEUE_KEY).await? else {
            return Ok(false);
        };
        let payload: LazyPayload = serde_json::from_str(&raw)?;
        debug!(queries = payload.queries.len(), "lazy payload popped");

        // SQL first, in payload order
        for (position, query) in payload.queries.iter().enumerate() {
            let LazyQuery(pool_code, sql, params) = query;
            let pool = engine.sql(pool_code)?;
            if let Err(err) = pool.exec(sql, params).await {
                warn!(position, error = %err, "lazy statement failed, re-enqueueing remainder");
                let broken = LazyPayload {
                    queries: payload.queries[position..].to_vec(),
                    local_deletes: payload.local_deletes.clone(),
                    redis_deletes: payload.redis_deletes.clone(),
                };
                self.requeue(engine, &broken).await?;
                return Err(err);
            }
        }

        // local cache deletions cannot fail
        for (pool_code, keys) in &payload.local_deletes {
            engine.local_cache(pool_code)?.remove(keys);
        }

        // remote deletions are idempotent; re-enqueue the unconfirmed rest
        let remote: Vec<(&String, &Vec<String>)> = payload.redis_deletes.iter().collect();
        for (position, (pool_code, keys)) in remote.iter().enumerate() {
            if let Err(err) = engine.redis(pool_code)?.del(keys).await {
                warn!(pool = %pool_code, error = %err, "lazy cache deletion failed, re-enqueueing");
                let broken = LazyPayload {
                    redis_deletes: remote[position..]
                        .iter()
                        .map(|(code, keys)| ((*code).clone(), (*keys).clone()))
                        .collect(),
                    ..LazyPayload::default()
                };
                self.requeue(engine, &broken).await?;
                return Err(err);
            }
        }
        Ok(true)
    }

    async fn requeue(&self, engine: &Engine, payload: &LazyPayload) -> Result<()> {
        let serialized = serde_json::to_string(payload)?;
        engine.lazy_queue_redis()?.rpush(LAZY_QUEUE_KEY, &serialized).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_matches_contract() {
        let payload = LazyPayload {
            queries: vec![LazyQuery(
                "default".to_string(),
                "UPDATE `User` SET `Name` = ? WHERE `ID` = ?".to_string(),
                vec![Some("a".to_string()), Some("1".to_string())],
            )],
            local_deletes: HashMap::from([(
                "default".to_string(),
                vec!["User123:1".to_string()],
            )]),
            redis_deletes: HashMap::new(),
        };
        let raw = serde_json::to_string(&payload).unwrap();
        assert!(raw.contains("\"q\":[[\"default\",\"UPDATE"));
        assert!(raw.contains("\"cl\":{\"default\""));
        assert!(!raw.contains("\"cr\""));

        let back: LazyPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.queries.len(), 1);
        assert_eq!(back.queries[0].0, "default");
        assert_eq!(back.local_deletes["default"], vec!["User123:1".to_string()]);
    }

    #[test]
    fn test_null_params_survive_roundtrip() {
        let payload = LazyPayload {
            queries: vec![LazyQuery(
                "default".to_string(),
                "INSERT INTO `User`(`Name`) VALUES (?)".to_string(),
                vec![None],
            )],
            ..LazyPayload::default()
        };
        let raw = serde_json::to_string(&payload).unwrap();
        let back: LazyPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.queries[0].2, vec![None]);
    }

    #[test]
    fn test_empty_payload() {
        assert!(LazyPayload::default().is_empty());
    }
}
