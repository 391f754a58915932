//! Cached-query engine.
//!
//! Serves declaratively defined cached indexes: the result of a (index,
//! arguments) combination is materialized into both caches as a compact
//! `{total}|{id1},{id2},…` envelope covering up to `max_rows` IDs. Misses
//! fill from SQL; invalidation happens on the flush side whenever a tracked
//! field of any matching row changes.

use std::sync::Arc;

use tracing::debug;

use crate::engine::search::{Pager, Where};
use crate::engine::Engine;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::schema::{CachedIndex, EntitySchema};
use crate::value::Value;

fn encode_envelope(total: usize, ids: &[u64]) -> String {
    let ids: Vec<String> = ids.iter().map(u64::to_string).collect();
    format!("{}|{}", total, ids.join(","))
}

fn decode_envelope(raw: &str) -> Option<(usize, Vec<u64>)> {
    let (total, ids) = raw.split_once('|')?;
    let total: usize = total.parse().ok()?;
    let ids = ids
        .split(',')
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect::<std::result::Result<Vec<u64>, _>>()
        .ok()?;
    Some((total, ids))
}

impl Engine {
    /// Serve a cached *many* index: total row count plus the requested page.
    pub async fn cached_search(
        &self,
        entity_name: &str,
        index_name: &str,
        pager: Pager,
        args: &[Value],
    ) -> Result<(usize, Vec<Entity>)> {
        self.cached_search_with_references(entity_name, index_name, pager, args, &[]).await
    }

    /// [`cached_search`](Engine::cached_search) plus reference warm-up.
    #[tracing::instrument(skip(self, args), fields(entity = entity_name, index = index_name))]
    pub async fn cached_search_with_references(
        &self,
        entity_name: &str,
        index_name: &str,
        pager: Pager,
        args: &[Value],
        references: &[&str],
    ) -> Result<(usize, Vec<Entity>)> {
        let schema = self.schema(entity_name)?;
        let index = schema
            .cached_index(index_name)
            .ok_or_else(|| EngineError::NotSupported(format!(
                "unknown cached index '{}' on entity '{}'",
                index_name, entity_name
            )))?
            .clone();
        if pager.current_page * pager.page_size > index.max_rows {
            return Err(EngineError::NotSupported(format!(
                "cached index '{}' pages past its max of {} rows",
                index_name, index.max_rows
            )));
        }

        let (total, ids) = self.cached_index_ids(&schema, &index, args).await?;
        let start = pager.offset().min(ids.len());
        let end = (start + pager.page_size).min(ids.len());
        let (mut entities, _missing) =
            self.load_by_ids_with_schema(&schema, &ids[start..end]).await?;
        if !references.is_empty() {
            self.warm_up_references(&mut entities, references).await?;
        }
        Ok((total, entities))
    }

    /// Serve a one-shot cached index: zero or one entity.
    #[tracing::instrument(skip(self, args), fields(entity = entity_name, index = index_name))]
    pub async fn cached_search_one(
        &self,
        entity_name: &str,
        index_name: &str,
        args: &[Value],
    ) -> Result<Option<Entity>> {
        let schema = self.schema(entity_name)?;
        let index = schema
            .cached_index_one(index_name)
            .ok_or_else(|| EngineError::NotSupported(format!(
                "unknown cached index '{}' on entity '{}'",
                index_name, entity_name
            )))?
            .clone();
        let (_total, ids) = self.cached_index_ids(&schema, &index, args).await?;
        match ids.first() {
            Some(&id) => self.load_by_id(entity_name, id).await,
            None => Ok(None),
        }
    }

    /// Force-evict row keys from every bound cache — the recovery hammer for
    /// rows changed in SQL behind the engine's back.
    pub async fn clear_by_ids(&self, entity_name: &str, ids: &[u64]) -> Result<()> {
        let schema = self.schema(entity_name)?;
        let keys: Vec<String> = ids.iter().map(|id| schema.cache_key(*id)).collect();
        if let Some(code) = &schema.local_cache {
            self.local_cache(code)?.remove(&keys);
        }
        if let Some(code) = &schema.redis_cache {
            self.redis(code)?.del(&keys).await?;
        }
        Ok(())
    }

    /// Resolve the materialized ID list of one (index, args) combination,
    /// filling both caches on a miss.
    async fn cached_index_ids(
        &self,
        schema: &Arc<EntitySchema>,
        index: &CachedIndex,
        args: &[Value],
    ) -> Result<(usize, Vec<u64>)> {
        let encoded_args: Vec<Option<String>> = args.iter().map(Value::to_sql_param).collect();
        let search_key = schema.search_key(&index.name, &encoded_args);

        let mut envelope: Option<String> = None;
        if let Some(code) = &schema.local_cache {
            envelope = self.local_cache(code)?.get(&search_key);
            crate::metrics::record_cache(code, "local", envelope.is_some());
        }
        if envelope.is_none() {
            if let Some(code) = &schema.redis_cache {
                envelope = self.redis(code)?.get(&search_key).await?;
                crate::metrics::record_cache(code, "redis", envelope.is_some());
                if let (Some(value), Some(local)) = (&envelope, &schema.local_cache) {
                    self.local_cache(local)?.set(&search_key, value.clone());
                }
            }
        }
        if let Some(raw) = envelope {
            if let Some(parsed) = decode_envelope(&raw) {
                return Ok(parsed);
            }
            debug!(key = %search_key, "discarding malformed cached envelope");
        }

        // miss: materialize from SQL up to max_rows
        let where_ = Where::new(&index.query, args.to_vec());
        let (ids, total) = self
            .search_ids_with_schema(schema, &where_, &Pager::new(1, index.max_rows), true)
            .await?;
        let envelope = encode_envelope(total, &ids);
        if let Some(code) = &schema.redis_cache {
            self.redis(code)?.set(&search_key, &envelope).await?;
        }
        if let Some(code) = &schema.local_cache {
            self.local_cache(code)?.set(&search_key, envelope);
        }
        Ok((total, ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let raw = encode_envelope(5, &[1, 2, 3]);
        assert_eq!(raw, "5|1,2,3");
        assert_eq!(decode_envelope(&raw), Some((5, vec![1, 2, 3])));
    }

    #[test]
    fn test_empty_envelope() {
        let raw = encode_envelope(0, &[]);
        assert_eq!(raw, "0|");
        assert_eq!(decode_envelope(&raw), Some((0, Vec::new())));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_envelope("nonsense"), None);
        assert_eq!(decode_envelope("x|1"), None);
        assert_eq!(decode_envelope("1|x"), None);
    }
}
