//! Flush-in-cache reconcile loop.
//!
//! [`Engine::flush_in_cache`](crate::engine::Engine::flush_in_cache) stashes
//! updates in the remote row cache and records `{entity}:{id}` in the sorted
//! set `dirty_queue` instead of writing SQL. This receiver drains that set:
//! for each member it re-reads the cached row, re-reads the authoritative
//! SQL row, diffs the two, issues the UPDATE and invalidates the search keys
//! derived from both images. Failed members are re-enqueued.

use tracing::{debug, warn};

use crate::dirty::{decode_row, dirty_bind, NIL_SENTINEL};
use crate::engine::flush::{build_update, cache_search_keys};
use crate::engine::search::Where;
use crate::engine::Engine;
use crate::error::Result;
use crate::queue::dirty::now_score;
use crate::value::Value;

/// Sorted set of `{entity}:{id}` members awaiting reconciliation.
pub const FLUSH_IN_CACHE_SET: &str = "dirty_queue";

#[derive(Debug)]
pub struct FlushInCacheReceiver {
    /// Redis pool holding the reconcile set.
    pub redis_pool: String,
}

impl FlushInCacheReceiver {
    pub fn new(redis_pool: &str) -> Self {
        Self { redis_pool: redis_pool.to_string() }
    }

    pub async fn size(&self, engine: &Engine) -> Result<u64> {
        engine.redis(&self.redis_pool)?.zcard(FLUSH_IN_CACHE_SET).await
    }

    /// Drain the set. Stops at the first failure after re-enqueueing the
    /// member, so nothing is lost across crashes.
    #[tracing::instrument(skip_all)]
    pub async fn digest(&self, engine: &Engine) -> Result<()> {
        let queue = engine.redis(&self.redis_pool)?;
        loop {
            let popped = queue.zpopmin(FLUSH_IN_CACHE_SET, 1).await?;
            let Some((member, _)) = popped.into_iter().next() else {
                break;
            };
            let Some((entity_name, id)) = parse_member(&member) else {
                continue;
            };
            let schema = engine.schema(&entity_name)?;
            let Some(cache_code) = schema.redis_cache.clone() else {
                continue;
            };
            let cache = engine.redis(&cache_code)?;

            let row_key = schema.cache_key(id);
            let Some(raw) = cache.get(&row_key).await? else {
                continue;
            };
            if raw == NIL_SENTINEL {
                continue;
            }

            // the cached copy is the desired state, SQL holds the old one
            let cached_row = decode_row(&raw)?;
            let mut entity = engine.entity_from_cached_row(&schema, id, &cached_row)?;
            let new_image = entity.db_data.clone();

            let authoritative = engine
                .search_one_with_schema(
                    &schema,
                    Where::new("`ID` = ?", vec![Value::Uint(id)]).include_fake_deleted(),
                )
                .await?;
            let Some(db_entity) = authoritative else {
                continue;
            };
            entity.db_data = db_entity.db_data.clone();

            let (dirty, bind) = dirty_bind(&entity)?;
            if !dirty {
                continue;
            }
            debug!(entity = %entity_name, id, columns = bind.len(), "reconciling cached row");

            let (sql, params) = build_update(&schema, &bind, id);
            if let Err(err) = engine.sql(&schema.sql_pool)?.exec(&sql, &params).await {
                warn!(entity = %entity_name, id, error = %err, "reconcile update failed");
                queue.zadd(FLUSH_IN_CACHE_SET, &member, now_score()).await?;
                return Err(err);
            }

            let mut keys = cache_search_keys(&schema, &bind, &db_entity.db_data, false);
            keys.extend(cache_search_keys(&schema, &bind, &new_image, false));
            keys.sort();
            keys.dedup();
            if !keys.is_empty() {
                if let Err(err) = cache.del(&keys).await {
                    queue.zadd(FLUSH_IN_CACHE_SET, &member, now_score()).await?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn member(entity_name: &str, id: u64) -> String {
    format!("{}:{}", entity_name, id)
}

fn parse_member(member: &str) -> Option<(String, u64)> {
    let (entity_name, id) = member.rsplit_once(':')?;
    Some((entity_name.to_string(), id.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_roundtrip() {
        let m = member("UserEntity", 42);
        assert_eq!(m, "UserEntity:42");
        assert_eq!(parse_member(&m), Some(("UserEntity".to_string(), 42)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_member("nocolon").is_none());
        assert!(parse_member("a:b").is_none());
    }
}
