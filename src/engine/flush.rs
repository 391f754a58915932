//! Flush planning and cache coordination.
//!
//! A flush walks the batch, asks the dirty tracker for bind maps and plans
//! the minimal statement set:
//!
//! 1. **Reference prefix pass** — entities referenced through
//!    `RefValue::Unsaved` are flushed first and the references patched to
//!    their assigned IDs. Lazy mode refuses unsaved references.
//! 2. **Classification** — marked-to-delete rows group into DELETEs; fresh
//!    entities with an `ON DUPLICATE KEY UPDATE` clause run as single-row
//!    upserts; other fresh entities accumulate into one multi-row INSERT
//!    per type; everything else is an UPDATE by ID.
//! 3. **Side effects** — every statement derives its cache effects (row key
//!    sets/deletes, search-key invalidation from both the pre- and
//!    post-image) and queue records (dirty fan-out, change log, lazy
//!    payload), staged and applied only after the SQL in their group
//!    succeeded. Inside a transaction, local sets and remote deletes are
//!    deferred to commit.
//!
//! Invalidation is always over-, never under-applied: a failed flush leaves
//! already-issued invalidations in place.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use tracing::debug;

use crate::dirty::{dirty_bind, encode_row, inject_bind, BindMap, NIL_SENTINEL};
use crate::engine::search::{Pager, Where};
use crate::engine::Engine;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::queue::dirty::{now_score, queue_key, DirtyData};
use crate::queue::lazy::{LazyPayload, LazyQuery, LAZY_QUEUE_KEY};
use crate::queue::log::{LogQueueValue, LOG_QUEUE_NAME};
use crate::schema::EntitySchema;
use crate::value::{RefValue, Value};

/// Cascade deletes page through referers in chunks of this size.
const CASCADE_PAGE_SIZE: usize = 1000;

impl Engine {
    /// Flush a batch of tracked entities: compute the minimal statement set,
    /// execute it, then apply the derived cache and queue effects.
    ///
    /// On error the batch keeps its state (bind maps are only folded into
    /// snapshots after their statement succeeded), so the caller may inspect
    /// and retry. Already-applied invalidations are not rolled back.
    #[tracing::instrument(skip_all, fields(entities = entities.len()))]
    pub async fn flush(&mut self, entities: &mut [Entity]) -> Result<()> {
        let started = Instant::now();
        let indices: Vec<usize> = (0..entities.len()).collect();
        self.flush_indices(entities, indices, false).await?;
        crate::metrics::record_flush(entities.len(), started.elapsed());
        Ok(())
    }

    /// Write-behind flush: statements and cache deletions are serialized to
    /// the lazy queue instead of being applied synchronously.
    #[tracing::instrument(skip_all, fields(entities = entities.len()))]
    pub async fn flush_lazy(&mut self, entities: &mut [Entity]) -> Result<()> {
        let started = Instant::now();
        let indices: Vec<usize> = (0..entities.len()).collect();
        self.flush_indices(entities, indices, true).await?;
        crate::metrics::record_flush(entities.len(), started.elapsed());
        Ok(())
    }

    pub(crate) fn flush_indices<'a>(
        &'a mut self,
        entities: &'a mut [Entity],
        indices: Vec<usize>,
        lazy: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.flush_batch(entities, indices, lazy).await })
    }

    async fn flush_batch(
        &mut self,
        entities: &mut [Entity],
        mut indices: Vec<usize>,
        lazy: bool,
    ) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }

        // 1. reference prefix pass
        let mut unsaved: Vec<usize> = Vec::new();
        for &i in &indices {
            let entity = &entities[i];
            for idx in 0..entity.schema().columns.len() {
                if let Value::Ref(RefValue::Unsaved(j)) = *entity.value_at(idx) {
                    if j >= entities.len() {
                        return Err(EngineError::NotSupported(format!(
                            "unsaved reference to batch position {} out of range",
                            j
                        )));
                    }
                    if entities[j].id() == 0 && !unsaved.contains(&j) {
                        unsaved.push(j);
                    }
                }
            }
        }
        if !unsaved.is_empty() {
            if lazy {
                return Err(EngineError::NotSupported(
                    "lazy flush for unsaved references".to_string(),
                ));
            }
            debug!(count = unsaved.len(), "flushing unsaved references first");
            self.flush_indices(entities, unsaved.clone(), false).await?;
            let assigned: Vec<u64> = entities.iter().map(Entity::id).collect();
            for &i in &indices {
                let entity = &mut entities[i];
                for idx in 0..entity.schema().columns.len() {
                    if let Value::Ref(RefValue::Unsaved(j)) = *entity.value_at(idx) {
                        entity.set_value_at(idx, Value::Ref(RefValue::Id(assigned[j])));
                    }
                }
            }
            indices.retain(|i| !unsaved.contains(i));
        }

        // 2. classification; updates and upserts execute inline
        let mut fx = FlushEffects::default();
        let mut insert_groups: IndexMap<String, InsertGroup> = IndexMap::new();
        let mut delete_groups: IndexMap<String, Vec<(u64, HashMap<String, Option<String>>)>> =
            IndexMap::new();

        for &i in &indices {
            let (dirty, bind) = dirty_bind(&entities[i])?;
            if !dirty {
                continue;
            }
            let schema = entities[i].schema().clone();
            let id = entities[i].id();

            if entities[i].is_marked_to_delete() {
                delete_groups
                    .entry(schema.name.clone())
                    .or_default()
                    .push((id, entities[i].db_data.clone()));
                continue;
            }

            if entities[i].db_data.is_empty() {
                if entities[i].on_duplicate.is_some() {
                    self.flush_upsert(entities, i, &schema, bind, lazy, &mut fx).await?;
                } else {
                    let mut bind = bind;
                    if id > 0 {
                        bind.insert("ID".to_string(), Some(id.to_string()));
                    }
                    let group =
                        insert_groups.entry(schema.name.clone()).or_insert_with(|| InsertGroup {
                            keys: bind.keys().cloned().collect(),
                            args: Vec::new(),
                            members: Vec::new(),
                        });
                    let InsertGroup { keys, args, members } = group;
                    for key in keys.iter() {
                        args.push(bind.get(key).cloned().flatten());
                    }
                    members.push((i, bind));
                }
                continue;
            }

            // update path
            if !entities[i].is_loaded() {
                return Err(EngineError::NotLoaded { name: schema.name.clone(), id });
            }
            let (sql, params) = build_update(&schema, &bind, id);
            if lazy {
                fx.lazy_query(&schema.sql_pool, sql, params);
            } else {
                self.exec(&schema.sql_pool, &sql, &params).await?;
            }
            let old = entities[i].db_data.clone();
            inject_bind(&mut entities[i], &bind);
            let new_data = entities[i].db_data.clone();
            if let Some(code) = &schema.local_cache {
                fx.local_set(code, schema.cache_key(id), encode_row(&schema, &new_data)?);
                fx.local_delete(code, cache_search_keys(&schema, &bind, &new_data, false));
                fx.local_delete(code, cache_search_keys(&schema, &bind, &old, false));
            }
            if let Some(code) = &schema.redis_cache {
                fx.redis_delete(code, vec![schema.cache_key(id)]);
                fx.redis_delete(code, cache_search_keys(&schema, &bind, &new_data, false));
                fx.redis_delete(code, cache_search_keys(&schema, &bind, &old, false));
            }
            fx.add_dirty(&schema, &bind, id, 'u');
            fx.add_log(&schema, id, Some(old), Some(bind_to_map(&bind)), &self.log_meta);
        }

        // 3. multi-row inserts, one statement per type; the first insert ID
        // belongs to the first row, later rows get consecutive IDs
        for (schema_name, group) in insert_groups {
            let schema = self.schema(&schema_name)?;
            let sql = build_insert(&schema.table_name, &group.keys, group.members.len());
            let mut next_id = 0u64;
            if lazy {
                fx.lazy_query(&schema.sql_pool, sql, group.args);
            } else {
                let result = self.exec(&schema.sql_pool, &sql, &group.args).await?;
                next_id = result.last_insert_id;
            }
            for (i, bind) in group.members {
                inject_bind(&mut entities[i], &bind);
                if !lazy && entities[i].id() == 0 {
                    entities[i].id = next_id;
                    next_id += 1;
                }
                let id = entities[i].id();
                let row_value = encode_row(&schema, &entities[i].db_data)?;
                fx.insert_effects(&schema, id, &bind, row_value, lazy, &self.log_meta);
            }
        }

        // 4. deletes, cascading through reverse references first
        for (schema_name, rows) in delete_groups {
            let schema = self.schema(&schema_name)?;
            let ids: Vec<u64> = rows.iter().map(|(id, _)| *id).collect();
            let in_list = ids.iter().map(u64::to_string).collect::<Vec<_>>().join(",");
            let sql = format!("DELETE FROM `{}` WHERE `ID` IN ({})", schema.table_name, in_list);
            if lazy {
                fx.lazy_query(&schema.sql_pool, sql, Vec::new());
            } else {
                self.cascade_delete(&schema, &in_list, lazy).await?;
                self.exec(&schema.sql_pool, &sql, &[]).await?;
            }
            for (id, old) in rows {
                let bind = map_to_bind(&schema, &old);
                if let Some(code) = &schema.local_cache {
                    fx.local_set(code, schema.cache_key(id), NIL_SENTINEL.to_string());
                    fx.local_delete(code, cache_search_keys(&schema, &bind, &old, true));
                }
                if let Some(code) = &schema.redis_cache {
                    fx.redis_delete(code, vec![schema.cache_key(id)]);
                    fx.redis_delete(code, cache_search_keys(&schema, &bind, &old, true));
                }
                fx.add_dirty(&schema, &bind, id, 'd');
                fx.add_log(&schema, id, Some(old), None, &self.log_meta);
            }
        }

        self.apply_effects(fx, lazy).await
    }

    /// Single-row `INSERT ... ON DUPLICATE KEY UPDATE`.
    async fn flush_upsert(
        &mut self,
        entities: &mut [Entity],
        i: usize,
        schema: &Arc<EntitySchema>,
        bind: BindMap,
        lazy: bool,
        fx: &mut FlushEffects,
    ) -> Result<()> {
        let on_dup = entities[i].on_duplicate.clone().expect("classified as upsert");
        let columns: Vec<String> = bind.keys().map(|k| format!("`{}`", k)).collect();
        let placeholders = vec!["?"; bind.len()].join(",");
        let clause = if on_dup.assignments.is_empty() {
            "`ID` = `ID`".to_string()
        } else {
            on_dup.assignments
        };
        let sql = format!(
            "INSERT INTO `{}`({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            schema.table_name,
            columns.join(","),
            placeholders,
            clause
        );
        let mut params: Vec<Option<String>> = bind.values().cloned().collect();
        params.extend(on_dup.params);

        if lazy {
            fx.lazy_query(&schema.sql_pool, sql, params);
            return Ok(());
        }
        let result = self.exec(&schema.sql_pool, &sql, &params).await?;
        if result.rows_affected > 0 {
            inject_bind(&mut entities[i], &bind);
            entities[i].id = result.last_insert_id;
            let row_value = encode_row(schema, &entities[i].db_data)?;
            fx.insert_effects(schema, entities[i].id(), &bind, row_value, lazy, &self.log_meta);
            // two affected rows means an existing row was updated: reload to
            // capture the post-update state
            if result.rows_affected == 2 {
                self.refresh_entity(&mut entities[i]).await?;
            }
            return Ok(());
        }

        // no row changed: locate the existing one through the first unique
        // index (declaration order) whose columns are all non-NULL in the bind
        for columns in schema.unique_indexes.values() {
            let mut fields = Vec::with_capacity(columns.len());
            let mut lookup: Vec<Value> = Vec::with_capacity(columns.len());
            let mut all_present = true;
            for column in columns {
                match bind.get(column).cloned().flatten() {
                    Some(value) => {
                        fields.push(format!("`{}` = ?", column));
                        lookup.push(Value::String(value));
                    }
                    None => {
                        all_present = false;
                        break;
                    }
                }
            }
            if !all_present {
                continue;
            }
            let where_ = Where::new(&fields.join(" AND "), lookup);
            return match self.search_one_with_schema(schema, where_).await? {
                Some(found) => {
                    entities[i] = found;
                    Ok(())
                }
                None => Err(EngineError::NotSupported(
                    "missing unique index to find updated row".to_string(),
                )),
            };
        }
        Err(EngineError::NotSupported("missing unique index to find updated row".to_string()))
    }

    /// Recursively mark-and-flush rows of other types holding a `cascade`
    /// reference at the deleted IDs, one page at a time.
    async fn cascade_delete(
        &mut self,
        schema: &Arc<EntitySchema>,
        in_list: &str,
        lazy: bool,
    ) -> Result<()> {
        let usage: Vec<(String, String)> = self.registry().usage_of(&schema.name).to_vec();
        for (referer, column) in usage {
            let ref_schema = self.schema(&referer)?;
            let is_cascade = ref_schema
                .column(&column)
                .map(|c| c.tags.contains_key("cascade"))
                .unwrap_or(false);
            if !is_cascade {
                continue;
            }
            loop {
                let where_ = Where::new(&format!("`{}` IN ({})", column, in_list), Vec::new());
                let mut page = self
                    .search_with_schema(&ref_schema, &where_, &Pager::new(1, CASCADE_PAGE_SIZE))
                    .await?;
                if page.is_empty() {
                    break;
                }
                debug!(referer = %referer, column = %column, rows = page.len(), "cascade delete");
                for child in &mut page {
                    child.mark_to_delete();
                }
                let all: Vec<usize> = (0..page.len()).collect();
                self.flush_indices(&mut page, all, lazy).await?;
            }
        }
        Ok(())
    }

    /// Apply staged effects after all SQL in the batch succeeded.
    async fn apply_effects(&mut self, fx: FlushEffects, lazy: bool) -> Result<()> {
        let FlushEffects { local_sets, local_deletes, redis_deletes, dirty, logs, mut lazy_payload } =
            fx;

        for (cache_code, pairs) in local_sets {
            if let Some(scope) = self.tx.as_mut() {
                scope.local_sets.entry(cache_code).or_default().extend(pairs);
            } else {
                self.local_cache(&cache_code)?.mset(pairs);
            }
        }
        for (cache_code, keys) in local_deletes {
            let keys: Vec<String> = keys.into_iter().collect();
            if lazy {
                lazy_payload.local_deletes.entry(cache_code).or_default().extend(keys);
            } else {
                self.local_cache(&cache_code)?.remove(&keys);
            }
        }
        for (cache_code, keys) in redis_deletes {
            let keys: Vec<String> = keys.into_iter().collect();
            if lazy {
                lazy_payload.redis_deletes.entry(cache_code).or_default().extend(keys);
            } else if let Some(scope) = self.tx.as_mut() {
                scope.redis_deletes.entry(cache_code).or_default().extend(keys);
            } else {
                self.redis(&cache_code)?.del(&keys).await?;
            }
        }

        if !lazy_payload.is_empty() {
            let serialized = serde_json::to_string(&lazy_payload)?;
            self.lazy_queue_redis()?.rpush(LAZY_QUEUE_KEY, &serialized).await?;
            crate::metrics::record_queue_publish(LAZY_QUEUE_KEY, 1);
        }

        for (sink, entries) in dirty {
            let pool_code = self
                .registry()
                .dirty_sinks
                .get(&sink)
                .cloned()
                .ok_or_else(|| EngineError::InvalidConfig(format!(
                    "unregistered dirty sink '{}'",
                    sink
                )))?;
            let key = queue_key(&sink);
            let count = entries.len();
            let pool = self.redis(&pool_code)?;
            for ((entity_name, id), action) in entries {
                pool.zadd(&key, &DirtyData::member(&entity_name, action, id), now_score())
                    .await?;
            }
            crate::metrics::record_queue_publish(&key, count);
        }

        if !logs.is_empty() {
            let count = logs.len();
            let queue = self.ensure_log_queue().await?;
            for log in &logs {
                queue.publish(&serde_json::to_vec(log)?).await?;
            }
            crate::metrics::record_queue_publish(LOG_QUEUE_NAME, count);
        }
        Ok(())
    }
}

struct InsertGroup {
    keys: Vec<String>,
    args: Vec<Option<String>>,
    members: Vec<(usize, BindMap)>,
}

/// Staged side effects of one flush batch.
#[derive(Default)]
struct FlushEffects {
    local_sets: HashMap<String, Vec<(String, String)>>,
    local_deletes: HashMap<String, BTreeSet<String>>,
    redis_deletes: HashMap<String, BTreeSet<String>>,
    /// sink -> (entity, id) -> action; the map makes "at most one record per
    /// (sink, entity, id) per flush" structural.
    dirty: IndexMap<String, IndexMap<(String, u64), char>>,
    logs: Vec<LogQueueValue>,
    lazy_payload: LazyPayload,
}

impl FlushEffects {
    fn local_set(&mut self, code: &str, key: String, value: String) {
        self.local_sets.entry(code.to_string()).or_default().push((key, value));
    }

    fn local_delete(&mut self, code: &str, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        self.local_deletes.entry(code.to_string()).or_default().extend(keys);
    }

    fn redis_delete(&mut self, code: &str, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        self.redis_deletes.entry(code.to_string()).or_default().extend(keys);
    }

    fn lazy_query(&mut self, pool: &str, sql: String, params: Vec<Option<String>>) {
        self.lazy_payload.queries.push(LazyQuery(pool.to_string(), sql, params));
    }

    /// Effects of one inserted row (shared by multi-row inserts and upserts).
    fn insert_effects(
        &mut self,
        schema: &EntitySchema,
        id: u64,
        bind: &BindMap,
        row_value: String,
        lazy: bool,
        meta: &serde_json::Map<String, serde_json::Value>,
    ) {
        let data = bind_to_map(bind);
        if let Some(code) = &schema.local_cache {
            if lazy {
                // the row lands later; poison instead of caching a guess
                self.local_delete(code, vec![schema.cache_key(id)]);
            } else {
                self.local_set(code, schema.cache_key(id), row_value);
            }
            self.local_delete(code, cache_search_keys(schema, bind, &data, true));
        }
        if let Some(code) = &schema.redis_cache {
            self.redis_delete(code, vec![schema.cache_key(id)]);
            self.redis_delete(code, cache_search_keys(schema, bind, &data, true));
        }
        self.add_dirty(schema, bind, id, 'i');
        self.add_log(schema, id, None, Some(bind_to_map(bind)), meta);
    }

    fn add_dirty(&mut self, schema: &EntitySchema, bind: &BindMap, id: u64, action: char) {
        let mut sinks: Vec<&str> = schema.dirty_sinks.iter().map(String::as_str).collect();
        for column in &schema.columns {
            if bind.contains_key(&column.name) {
                sinks.extend(column.dirty_sinks());
            }
        }
        for sink in sinks {
            self.dirty
                .entry(sink.to_string())
                .or_default()
                .insert((schema.name.clone(), id), action);
        }
    }

    fn add_log(
        &mut self,
        schema: &EntitySchema,
        id: u64,
        before: Option<HashMap<String, Option<String>>>,
        changes: Option<HashMap<String, Option<String>>>,
        meta: &serde_json::Map<String, serde_json::Value>,
    ) {
        if !schema.has_log {
            return;
        }
        self.logs.push(LogQueueValue {
            table: schema.log_table_name.clone(),
            id,
            before,
            changes,
            updated_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            meta: if meta.is_empty() { None } else { Some(meta.clone()) },
        });
    }
}

/// Search keys to invalidate for one entity change.
///
/// `bind` scopes which indexes are affected; `data` supplies the argument
/// projection (pre- or post-image). `added_deleted` marks inserts/deletes,
/// which also invalidate unfiltered indexes; a `FakeDelete` bind entry has
/// the same effect.
pub(crate) fn cache_search_keys(
    schema: &EntitySchema,
    bind: &BindMap,
    data: &HashMap<String, Option<String>>,
    added_deleted: bool,
) -> Vec<String> {
    let mut keys = Vec::new();
    let added_deleted = added_deleted
        || (schema.has_fake_delete && bind.contains_key("FakeDelete"));
    for index in schema.all_cached_indexes() {
        if added_deleted && index.tracked_fields.is_empty() {
            keys.push(schema.search_key(&index.name, &[]));
        }
        let affected = index.tracked_fields.iter().any(|f| bind.contains_key(f))
            || (added_deleted && index.query_fields.iter().any(|f| f == "FakeDelete"));
        if affected {
            let args: Vec<Option<String>> = index
                .query_fields
                .iter()
                .filter(|f| f.as_str() != "FakeDelete")
                .map(|f| data.get(f).cloned().flatten())
                .collect();
            keys.push(schema.search_key(&index.name, &args));
        }
    }
    keys
}

pub(crate) fn build_update(
    schema: &EntitySchema,
    bind: &BindMap,
    id: u64,
) -> (String, Vec<Option<String>>) {
    let sets: Vec<String> = bind.keys().map(|k| format!("`{}` = ?", k)).collect();
    let sql =
        format!("UPDATE `{}` SET {} WHERE `ID` = ?", schema.table_name, sets.join(","));
    let mut params: Vec<Option<String>> = bind.values().cloned().collect();
    params.push(Some(id.to_string()));
    (sql, params)
}

fn build_insert(table: &str, keys: &[String], rows: usize) -> String {
    let columns: Vec<String> = keys.iter().map(|k| format!("`{}`", k)).collect();
    let row = format!("({})", vec!["?"; keys.len()].join(","));
    format!("INSERT INTO `{}`({}) VALUES {}", table, columns.join(","), vec![row; rows].join(","))
}

fn bind_to_map(bind: &BindMap) -> HashMap<String, Option<String>> {
    bind.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Snapshot map back into declaration order for bind-style matching.
fn map_to_bind(schema: &EntitySchema, data: &HashMap<String, Option<String>>) -> BindMap {
    let mut bind = BindMap::new();
    for column in schema.persisted_columns() {
        if let Some(value) = data.get(&column.name) {
            bind.insert(column.name.clone(), value.clone());
        }
    }
    bind
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, SchemaBuilder, ValidationContext};
    use crate::value::{Column, ColumnKind};

    fn build_schema(fake_delete: bool, log: bool) -> EntitySchema {
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
        let mut builder = SchemaBuilder::new("UserEntity")
            .table("User")
            .local_cache("default")
            .redis_cache("default")
            .column(Column::new("Name", ColumnKind::String { length: Some(100) }))
            .column(Column::new("Age", ColumnKind::Uint { bits: 16 }).tag("dirty", "search"))
            .query("IndexAge", ":Age = ? ORDER BY :ID")
            .query("IndexAll", "")
            .query_one("IndexName", ":Name = ?");
        if fake_delete {
            builder = builder.fake_delete();
        }
        if log {
            builder = builder.log();
        }
        EntitySchema::build(&builder.build(), &ctx).unwrap()
    }

    fn bind_of(pairs: &[(&str, Option<&str>)]) -> BindMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.map(str::to_string))).collect()
    }

    fn data_of(pairs: &[(&str, Option<&str>)]) -> HashMap<String, Option<String>> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.map(str::to_string))).collect()
    }

    #[test]
    fn test_update_invalidates_pre_and_post_image_keys() {
        let schema = build_schema(false, false);
        let bind = bind_of(&[("Age", Some("18"))]);
        let old = data_of(&[("Name", Some("a")), ("Age", Some("10"))]);
        let new = data_of(&[("Name", Some("a")), ("Age", Some("18"))]);

        let old_keys = cache_search_keys(&schema, &bind, &old, false);
        let new_keys = cache_search_keys(&schema, &bind, &new, false);
        assert_eq!(old_keys, vec![schema.search_key("IndexAge", &[Some("10".to_string())])]);
        assert_eq!(new_keys, vec![schema.search_key("IndexAge", &[Some("18".to_string())])]);
        assert_ne!(old_keys, new_keys);
    }

    #[test]
    fn test_untracked_update_invalidates_nothing() {
        let schema = build_schema(false, false);
        let bind = bind_of(&[("Name", Some("b"))]);
        let data = data_of(&[("Name", Some("b")), ("Age", Some("10"))]);
        // Name is tracked by the one-shot index only
        let keys = cache_search_keys(&schema, &bind, &data, false);
        assert_eq!(keys, vec![schema.search_key("IndexName", &[Some("b".to_string())])]);
    }

    #[test]
    fn test_insert_invalidates_unfiltered_index() {
        let schema = build_schema(false, false);
        let bind = bind_of(&[("Name", Some("a")), ("Age", Some("10"))]);
        let data = bind_to_map(&bind);
        let keys = cache_search_keys(&schema, &bind, &data, true);
        assert!(keys.contains(&schema.search_key("IndexAll", &[])));
        assert!(keys.contains(&schema.search_key("IndexAge", &[Some("10".to_string())])));
        assert!(keys.contains(&schema.search_key("IndexName", &[Some("a".to_string())])));
    }

    #[test]
    fn test_fake_delete_toggle_counts_as_delete() {
        let schema = build_schema(true, false);
        let bind = bind_of(&[("FakeDelete", Some("7"))]);
        let data = data_of(&[("Name", Some("a")), ("Age", Some("10")), ("FakeDelete", Some("7"))]);
        let keys = cache_search_keys(&schema, &bind, &data, false);
        // the unfiltered index and the filtered ones (projection skips FakeDelete)
        assert!(keys.contains(&schema.search_key("IndexAll", &[])));
        assert!(keys.contains(&schema.search_key("IndexAge", &[Some("10".to_string())])));
    }

    #[test]
    fn test_build_update_shape() {
        let schema = build_schema(false, false);
        let bind = bind_of(&[("Name", Some("a")), ("Age", None)]);
        let (sql, params) = build_update(&schema, &bind, 5);
        assert_eq!(sql, "UPDATE `User` SET `Name` = ?,`Age` = ? WHERE `ID` = ?");
        assert_eq!(params, vec![Some("a".to_string()), None, Some("5".to_string())]);
    }

    #[test]
    fn test_build_insert_shape() {
        let sql = build_insert("User", &["Name".to_string(), "Age".to_string()], 3);
        assert_eq!(sql, "INSERT INTO `User`(`Name`,`Age`) VALUES (?,?),(?,?),(?,?)");
    }

    #[test]
    fn test_dirty_fanout_dedupes_per_entity_and_id() {
        let schema = build_schema(false, false);
        let mut fx = FlushEffects::default();
        let bind = bind_of(&[("Age", Some("18")), ("Name", Some("x"))]);
        fx.add_dirty(&schema, &bind, 1, 'u');
        fx.add_dirty(&schema, &bind, 1, 'u');
        fx.add_dirty(&schema, &bind, 2, 'u');
        assert_eq!(fx.dirty["search"].len(), 2);
    }

    #[test]
    fn test_dirty_fanout_skips_unchanged_columns() {
        let schema = build_schema(false, false);
        let mut fx = FlushEffects::default();
        let bind = bind_of(&[("Name", Some("x"))]);
        fx.add_dirty(&schema, &bind, 1, 'u');
        assert!(fx.dirty.is_empty());
    }

    #[test]
    fn test_lazy_insert_poisons_row_key_instead_of_caching() {
        let schema = build_schema(false, false);
        let mut fx = FlushEffects::default();
        let bind = bind_of(&[("Name", Some("a")), ("Age", Some("10"))]);
        fx.insert_effects(&schema, 4, &bind, "row".to_string(), true, &serde_json::Map::new());
        assert!(fx.local_sets.is_empty());
        assert!(fx.local_deletes["default"].contains(&schema.cache_key(4)));
        assert!(fx.redis_deletes["default"].contains(&schema.cache_key(4)));
    }

    #[test]
    fn test_insert_effects_cache_row_and_log() {
        let schema = build_schema(false, true);
        let mut fx = FlushEffects::default();
        let bind = bind_of(&[("Name", Some("a")), ("Age", Some("10"))]);
        fx.insert_effects(&schema, 4, &bind, "row".to_string(), false, &serde_json::Map::new());
        assert_eq!(fx.local_sets["default"][0], (schema.cache_key(4), "row".to_string()));
        let log = &fx.logs[0];
        assert_eq!(log.table, "_log_default_User");
        assert_eq!(log.id, 4);
        assert!(log.before.is_none());
        assert_eq!(log.changes.as_ref().unwrap()["Age"].as_deref(), Some("10"));
    }
}
