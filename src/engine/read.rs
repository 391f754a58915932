//! Reads through the cache hierarchy.
//!
//! `load_by_id` checks the local pool, then the remote pool, then SQL, and
//! repopulates the caches on the way out — including the `"nil"` negative
//! sentinel for IDs known absent, so lookups of recently deleted rows never
//! reach SQL. `load_by_ids` does the same with pipelined MGET/MSET and one
//! multi-row SELECT.
//!
//! Rows decoded from any source are normalized through the codec: `db_data`
//! always holds canonical strings, so a freshly loaded entity is clean.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::dirty::{decode_row, encode_row, NIL_SENTINEL};
use crate::engine::search::{Pager, Where};
use crate::engine::Engine;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::schema::EntitySchema;
use crate::value::{decode, encode, ColumnKind, RefValue, Value};

/// Build an entity from a SQL row: `ID` string first, then the persisted
/// columns in declaration order.
pub(crate) fn entity_from_row(
    schema: &Arc<EntitySchema>,
    row: &[Option<String>],
) -> Result<Entity> {
    let id: u64 = row
        .first()
        .and_then(|v| v.as_deref())
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    fill_entity(schema, id, &row[1..])
}

/// Build an entity from a cached row envelope (persisted columns only; the
/// row key carries the ID).
pub(crate) fn entity_from_cached_row(
    schema: &Arc<EntitySchema>,
    id: u64,
    row: &[Option<String>],
) -> Result<Entity> {
    fill_entity(schema, id, row)
}

fn fill_entity(schema: &Arc<EntitySchema>, id: u64, row: &[Option<String>]) -> Result<Entity> {
    let mut entity = schema.new_entity();
    entity.id = id;
    let mut cursor = 0;
    for (idx, column) in schema.columns.iter().enumerate() {
        if column.is_ignored() {
            continue;
        }
        let raw = row.get(cursor).cloned().flatten();
        cursor += 1;
        let value = decode(column, raw.as_deref())?;
        let canonical = encode(column, &value, id)?;
        entity.set_value_at(idx, value);
        entity.db_data.insert(column.name.clone(), canonical);
    }
    entity.loaded = true;
    Ok(entity)
}

impl Engine {
    /// Load one entity by ID through local cache, remote cache and SQL.
    /// Soft-deleted rows count as absent.
    #[tracing::instrument(skip(self), fields(entity = entity_name))]
    pub async fn load_by_id(&self, entity_name: &str, id: u64) -> Result<Option<Entity>> {
        let schema = self.schema(entity_name)?;
        let key = schema.cache_key(id);

        if let Some(code) = &schema.local_cache {
            if let Some(value) = self.local_cache(code)?.get(&key) {
                crate::metrics::record_cache(code, "local", true);
                debug!("local cache hit");
                if value == NIL_SENTINEL {
                    return Ok(None);
                }
                return Ok(Some(entity_from_cached_row(&schema, id, &decode_row(&value)?)?));
            }
            crate::metrics::record_cache(code, "local", false);
        }

        if let Some(code) = &schema.redis_cache {
            if let Some(value) = self.redis(code)?.get(&key).await? {
                crate::metrics::record_cache(code, "redis", true);
                debug!("remote cache hit");
                if let Some(local) = &schema.local_cache {
                    self.local_cache(local)?.set(&key, value.clone());
                }
                if value == NIL_SENTINEL {
                    return Ok(None);
                }
                return Ok(Some(entity_from_cached_row(&schema, id, &decode_row(&value)?)?));
            }
            crate::metrics::record_cache(code, "redis", false);
        }

        // row-by-ID is an identity lookup: soft-deleted rows still resolve,
        // matching what a cached copy would return
        let found = self
            .search_one_with_schema(
                &schema,
                Where::new("`ID` = ?", vec![Value::Uint(id)]).include_fake_deleted(),
            )
            .await?;
        match found {
            Some(entity) => {
                let envelope = encode_row(&schema, &entity.db_data)?;
                if let Some(code) = &schema.local_cache {
                    self.local_cache(code)?.set(&key, envelope.clone());
                }
                if let Some(code) = &schema.redis_cache {
                    self.redis(code)?.set(&key, &envelope).await?;
                }
                Ok(Some(entity))
            }
            None => {
                if let Some(code) = &schema.local_cache {
                    self.local_cache(code)?.set(&key, NIL_SENTINEL.to_string());
                }
                if let Some(code) = &schema.redis_cache {
                    self.redis(code)?.set(&key, NIL_SENTINEL).await?;
                }
                Ok(None)
            }
        }
    }

    /// [`load_by_id`](Engine::load_by_id) plus reference warm-up.
    pub async fn load_by_id_with_references(
        &self,
        entity_name: &str,
        id: u64,
        references: &[&str],
    ) -> Result<Option<Entity>> {
        let Some(entity) = self.load_by_id(entity_name, id).await? else {
            return Ok(None);
        };
        let mut entities = [entity];
        self.warm_up_references(&mut entities, references).await?;
        let [entity] = entities;
        Ok(Some(entity))
    }

    /// Multi-get through the cache hierarchy. Returns the found entities in
    /// input order plus the IDs that exist nowhere.
    #[tracing::instrument(skip(self, ids), fields(entity = entity_name, ids = ids.len()))]
    pub async fn load_by_ids(
        &self,
        entity_name: &str,
        ids: &[u64],
    ) -> Result<(Vec<Entity>, Vec<u64>)> {
        let schema = self.schema(entity_name)?;
        self.load_by_ids_with_schema(&schema, ids).await
    }

    pub(crate) async fn load_by_ids_with_schema(
        &self,
        schema: &Arc<EntitySchema>,
        ids: &[u64],
    ) -> Result<(Vec<Entity>, Vec<u64>)> {
        let mut found: HashMap<u64, Entity> = HashMap::new();
        let mut remaining: Vec<u64> = {
            let mut unique: Vec<u64> = ids.to_vec();
            unique.sort_unstable();
            unique.dedup();
            unique
        };

        if let Some(code) = &schema.local_cache {
            let pool = self.local_cache(code)?;
            let keys: Vec<String> = remaining.iter().map(|id| schema.cache_key(*id)).collect();
            let values = pool.mget(&keys);
            let mut still = Vec::new();
            for (id, value) in remaining.iter().zip(values) {
                match value {
                    // nil-cached IDs are known absent: no further tier
                    Some(value) if value == NIL_SENTINEL => {}
                    Some(value) => {
                        found.insert(
                            *id,
                            entity_from_cached_row(schema, *id, &decode_row(&value)?)?,
                        );
                    }
                    None => still.push(*id),
                }
            }
            remaining = still;
        }

        if !remaining.is_empty() {
            if let Some(code) = &schema.redis_cache {
                let pool = self.redis(code)?;
                let keys: Vec<String> = remaining.iter().map(|id| schema.cache_key(*id)).collect();
                let values = pool.mget(&keys).await?;
                let mut still = Vec::new();
                let mut backfill = Vec::new();
                for ((id, key), value) in remaining.iter().zip(keys.iter()).zip(values) {
                    match value {
                        Some(value) if value == NIL_SENTINEL => {
                            backfill.push((key.clone(), value));
                        }
                        Some(value) => {
                            found.insert(
                                *id,
                                entity_from_cached_row(schema, *id, &decode_row(&value)?)?,
                            );
                            backfill.push((key.clone(), value));
                        }
                        None => still.push(*id),
                    }
                }
                if let Some(local) = &schema.local_cache {
                    self.local_cache(local)?.mset(backfill);
                }
                remaining = still;
            }
        }

        if !remaining.is_empty() {
            let in_list =
                remaining.iter().map(u64::to_string).collect::<Vec<_>>().join(",");
            let where_ =
                Where::new(&format!("`ID` IN ({})", in_list), Vec::new()).include_fake_deleted();
            let loaded = self
                .search_with_schema(schema, &where_, &Pager::new(1, remaining.len()))
                .await?;
            let mut pairs = Vec::with_capacity(loaded.len());
            for entity in loaded {
                pairs.push((schema.cache_key(entity.id()), encode_row(schema, &entity.db_data)?));
                found.insert(entity.id(), entity);
            }
            if let Some(code) = &schema.redis_cache {
                self.redis(code)?.mset(&pairs).await?;
            }
            if let Some(code) = &schema.local_cache {
                self.local_cache(code)?.mset(pairs);
            }
        }

        let mut entities = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match found.get(id) {
                Some(entity) => entities.push(entity.clone()),
                None => missing.push(*id),
            }
        }
        Ok((entities, missing))
    }

    /// Load the entities referenced by the given columns (`"*"` for every
    /// reference column) and back-patch them onto their referers.
    pub(crate) async fn warm_up_references(
        &self,
        entities: &mut [Entity],
        references: &[&str],
    ) -> Result<()> {
        if entities.is_empty() || references.is_empty() {
            return Ok(());
        }
        let schema = entities[0].schema().clone();
        let columns: Vec<String> = if references == ["*"] {
            schema.ref_columns.clone()
        } else {
            let mut columns = Vec::new();
            for reference in references {
                if !schema.ref_columns.iter().any(|c| c == reference) {
                    return Err(EngineError::UnknownColumn {
                        entity: schema.name.clone(),
                        column: reference.to_string(),
                    });
                }
                columns.push(reference.to_string());
            }
            columns
        };

        for column in columns {
            let Some(ColumnKind::Ref { target }) = schema.column(&column).map(|c| c.kind.clone())
            else {
                continue;
            };
            let target_schema = self.schema(&target)?;
            let mut ids: Vec<u64> = entities
                .iter()
                .filter_map(|e| match e.get(&column) {
                    Ok(Value::Ref(RefValue::Id(id))) if *id > 0 => Some(*id),
                    _ => None,
                })
                .collect();
            ids.sort_unstable();
            ids.dedup();
            if ids.is_empty() {
                continue;
            }
            let (loaded, _) = self.load_by_ids_with_schema(&target_schema, &ids).await?;
            let by_id: HashMap<u64, Entity> =
                loaded.into_iter().map(|e| (e.id(), e)).collect();
            for entity in entities.iter_mut() {
                if let Ok(Value::Ref(RefValue::Id(id))) = entity.get(&column) {
                    if let Some(referenced) = by_id.get(id) {
                        entity.references.insert(column.clone(), referenced.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-read the authoritative row and replace the entity's state.
    pub(crate) async fn refresh_entity(&self, entity: &mut Entity) -> Result<bool> {
        let schema = entity.schema().clone();
        let fresh = self
            .search_one_with_schema(
                &schema,
                Where::new("`ID` = ?", vec![Value::Uint(entity.id())]).include_fake_deleted(),
            )
            .await?;
        match fresh {
            Some(fresh) => {
                *entity = fresh;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn entity_from_cached_row(
        &self,
        schema: &Arc<EntitySchema>,
        id: u64,
        row: &[Option<String>],
    ) -> Result<Entity> {
        entity_from_cached_row(schema, id, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaBuilder, ValidationContext};
    use crate::value::Column;

    fn user_schema() -> Arc<EntitySchema> {
        fn yes(_: &str) -> bool {
            true
        }
        let ctx = ValidationContext {
            entities: &yes,
            enums: &yes,
            sql_pools: &yes,
            local_pools: &yes,
            redis_pools: &yes,
            dirty_sinks: &yes,
        };
        let def = SchemaBuilder::new("UserEntity")
            .column(Column::new("Name", ColumnKind::String { length: Some(100) }))
            .column(Column::new("Age", ColumnKind::Uint { bits: 16 }))
            .column(Column::new("Score", ColumnKind::Float { double: false, decimal: None, unsigned: true }))
            .build();
        Arc::new(EntitySchema::build(&def, &ctx).unwrap())
    }

    #[test]
    fn test_entity_from_row_fills_and_normalizes() {
        let schema = user_schema();
        let row = vec![
            Some("7".to_string()),
            Some("a".to_string()),
            Some("10".to_string()),
            Some("1.110000".to_string()),
        ];
        let entity = entity_from_row(&schema, &row).unwrap();
        assert_eq!(entity.id(), 7);
        assert!(entity.is_loaded());
        assert_eq!(entity.get("Age").unwrap(), &Value::Uint(10));
        // db driver padding is normalized to the canonical form
        assert_eq!(entity.db_data["Score"].as_deref(), Some("1.11"));
        // a freshly loaded entity is clean
        let (dirty, _) = crate::dirty::dirty_bind(&entity).unwrap();
        assert!(!dirty);
    }

    #[test]
    fn test_entity_from_cached_row_has_no_id_column() {
        let schema = user_schema();
        let row = vec![Some("a".to_string()), Some("10".to_string()), None];
        let entity = entity_from_cached_row(&schema, 3, &row).unwrap();
        assert_eq!(entity.id(), 3);
        assert_eq!(entity.get("Name").unwrap(), &Value::String("a".to_string()));
        assert_eq!(entity.get("Score").unwrap(), &Value::Float(0.0));
    }

    #[test]
    fn test_entity_from_row_tolerates_missing_id() {
        let schema = user_schema();
        let entity = entity_from_row(&schema, &[None, None, None, None]).unwrap();
        assert_eq!(entity.id(), 0);
    }
}
