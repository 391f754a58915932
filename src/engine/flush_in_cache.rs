//! Flush-in-cache fast path.
//!
//! Updates are stashed in the remote row cache and the `{entity}:{id}`
//! member is added to the reconcile set; no SQL is written until the
//! [`FlushInCacheReceiver`](crate::queue::FlushInCacheReceiver) catches up.
//! Entities without a remote cache — and fresh or deleted ones — fall back
//! to a regular flush.

use tracing::debug;

use crate::dirty::{dirty_bind, encode_row, inject_bind};
use crate::engine::Engine;
use crate::entity::Entity;
use crate::error::Result;
use crate::queue::dirty::now_score;
use crate::queue::flush_in_cache::{member, FLUSH_IN_CACHE_SET};

impl Engine {
    /// Stash dirty updates in the remote cache and enqueue them for
    /// reconciliation. The in-memory snapshot is updated as if the flush had
    /// happened, so the entities read as clean afterwards.
    #[tracing::instrument(skip_all, fields(entities = entities.len()))]
    pub async fn flush_in_cache(&mut self, entities: &mut [Entity]) -> Result<()> {
        let mut fallback: Vec<usize> = Vec::new();
        for (i, entity) in entities.iter().enumerate() {
            let fast = entity.schema().redis_cache.is_some()
                && entity.is_loaded()
                && !entity.is_marked_to_delete()
                && entity.id() > 0;
            if !fast {
                fallback.push(i);
            }
        }

        for i in 0..entities.len() {
            if fallback.contains(&i) {
                continue;
            }
            let (dirty, bind) = dirty_bind(&entities[i])?;
            if !dirty {
                continue;
            }
            let schema = entities[i].schema().clone();
            let id = entities[i].id();
            inject_bind(&mut entities[i], &bind);

            let cache_code = schema.redis_cache.as_deref().expect("fast path requires a cache");
            let cache = self.redis(cache_code)?;
            let envelope = encode_row(&schema, &entities[i].db_data)?;
            cache.set(&schema.cache_key(id), &envelope).await?;
            cache
                .zadd(FLUSH_IN_CACHE_SET, &member(&schema.name, id), now_score())
                .await?;
            debug!(entity = %schema.name, id, columns = bind.len(), "stashed in cache");
        }

        if !fallback.is_empty() {
            self.flush_indices(entities, fallback, false).await?;
        }
        Ok(())
    }
}
