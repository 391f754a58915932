//! Static per-entity-type metadata.
//!
//! An [`EntitySchema`] is the frozen description of one entity type: its
//! columns and tags, cached-index definitions, cache pool bindings and the
//! derivation of every cache key the engine will ever write for it.
//!
//! Schemas are declared with a [`SchemaBuilder`] (typed field descriptors
//! stand in for the struct reflection of dynamic runtimes), registered on a
//! [`Registry`](crate::registry::Registry) and built/validated once when the
//! registry is frozen. After that they are shared read-only by every engine.
//!
//! # Cache keyspace
//!
//! ```text
//! row key:    {prefix}{stamp}:{id}            e.g. "User3735928559:42"
//! search key: {prefix}_{index}_{fnv1a32(args)} e.g. "User_IndexAge_193489"
//! ```
//!
//! The stamp is a 32-bit FNV-1a hash of the ordered column list, so renaming,
//! adding or reordering columns moves the whole keyspace and stale rows from
//! an older schema revision are never read after a deploy.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::value::{Column, ColumnKind};

/// Default result cap for a *many* cached index.
pub const DEFAULT_CACHED_INDEX_MAX: usize = 50_000;

/// A declaratively defined cached query (secondary index).
#[derive(Debug, Clone)]
pub struct CachedIndex {
    pub name: String,
    /// Rewritten WHERE fragment, `:Field` placeholders already backticked.
    pub query: String,
    /// Columns referenced by the template (never `ID`, never `FakeDelete`).
    pub tracked_fields: Vec<String>,
    /// `tracked_fields` plus the synthetic `FakeDelete` entry when the
    /// entity is soft-deleting; projection skips it when deriving key args.
    pub query_fields: Vec<String>,
    /// Result cap; 1 for one-shot indexes.
    pub max_rows: usize,
    pub one: bool,
}

/// Raw, unvalidated entity declaration produced by [`SchemaBuilder`].
#[derive(Debug, Clone)]
pub struct EntityDef {
    pub name: String,
    pub(crate) table: Option<String>,
    pub(crate) sql_pool: String,
    pub(crate) local_cache: Option<String>,
    pub(crate) redis_cache: Option<String>,
    pub(crate) columns: Vec<Column>,
    pub(crate) queries: Vec<QueryDef>,
    pub(crate) fake_delete: bool,
    pub(crate) log: bool,
    pub(crate) dirty_sinks: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct QueryDef {
    pub name: String,
    pub template: String,
    pub one: bool,
    pub max: usize,
}

/// Fluent declaration of one entity type.
///
/// ```
/// use entity_engine::{SchemaBuilder, Column, ColumnKind};
///
/// let def = SchemaBuilder::new("UserEntity")
///     .table("User")
///     .local_cache("default")
///     .redis_cache("default")
///     .column(Column::new("Name", ColumnKind::String { length: Some(100) })
///         .tag("unique", "NameIndex"))
///     .column(Column::new("Age", ColumnKind::Uint { bits: 16 }))
///     .query("IndexAge", ":Age = ? ORDER BY :ID")
///     .query_one("IndexName", ":Name = ?")
///     .build();
/// assert_eq!(def.name, "UserEntity");
/// ```
#[derive(Debug)]
pub struct SchemaBuilder {
    def: EntityDef,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: EntityDef {
                name: name.into(),
                table: None,
                sql_pool: "default".to_string(),
                local_cache: None,
                redis_cache: None,
                columns: Vec::new(),
                queries: Vec::new(),
                fake_delete: false,
                log: false,
                dirty_sinks: Vec::new(),
            },
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.def.table = Some(table.to_string());
        self
    }

    pub fn sql_pool(mut self, pool: &str) -> Self {
        self.def.sql_pool = pool.to_string();
        self
    }

    pub fn local_cache(mut self, pool: &str) -> Self {
        self.def.local_cache = Some(pool.to_string());
        self
    }

    pub fn redis_cache(mut self, pool: &str) -> Self {
        self.def.redis_cache = Some(pool.to_string());
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.def.columns.push(column);
        self
    }

    /// Flatten an embedded struct: every column lands with the given prefix.
    pub fn embed(mut self, prefix: &str, columns: Vec<Column>) -> Self {
        for mut column in columns {
            column.name = format!("{}{}", prefix, column.name);
            self.def.columns.push(column);
        }
        self
    }

    /// Declare a *many* cached index with the default result cap.
    pub fn query(self, name: &str, template: &str) -> Self {
        self.query_max(name, template, DEFAULT_CACHED_INDEX_MAX)
    }

    pub fn query_max(mut self, name: &str, template: &str, max: usize) -> Self {
        self.def.queries.push(QueryDef {
            name: name.to_string(),
            template: template.to_string(),
            one: false,
            max,
        });
        self
    }

    /// Declare a one-shot cached index (zero or one ID).
    pub fn query_one(mut self, name: &str, template: &str) -> Self {
        self.def.queries.push(QueryDef {
            name: name.to_string(),
            template: template.to_string(),
            one: true,
            max: 1,
        });
        self
    }

    /// Soft-delete via the synthetic `FakeDelete` column.
    pub fn fake_delete(mut self) -> Self {
        self.def.fake_delete = true;
        self
    }

    /// Emit change-log records for every flush of this entity.
    pub fn log(mut self) -> Self {
        self.def.log = true;
        self
    }

    /// Entity-level dirty sink: fires on every insert/update/delete.
    pub fn dirty(mut self, sink: &str) -> Self {
        self.def.dirty_sinks.push(sink.to_string());
        self
    }

    pub fn build(self) -> EntityDef {
        self.def
    }
}

/// Frozen entity metadata. Built once by registry validation.
#[derive(Debug)]
pub struct EntitySchema {
    pub name: String,
    pub table_name: String,
    pub sql_pool: String,
    pub local_cache: Option<String>,
    pub redis_cache: Option<String>,
    /// All columns in declaration order, the synthetic `FakeDelete` last.
    pub columns: Vec<Column>,
    pub cached_indexes: IndexMap<String, CachedIndex>,
    pub cached_indexes_one: IndexMap<String, CachedIndex>,
    /// Unique index name -> columns by position, in declaration order of the
    /// index names. The upsert path scans these in this exact order.
    pub unique_indexes: IndexMap<String, Vec<String>>,
    /// Reference columns in declaration order.
    pub ref_columns: Vec<String>,
    pub has_fake_delete: bool,
    pub has_log: bool,
    pub log_table_name: String,
    /// Entity-level dirty sinks (fire on every flush of this entity).
    pub dirty_sinks: Vec<String>,
    cache_prefix: String,
    columns_stamp: String,
}

/// Validation context handed in by the registry: what exists to bind to.
pub(crate) struct ValidationContext<'a> {
    pub entities: &'a dyn Fn(&str) -> bool,
    pub enums: &'a dyn Fn(&str) -> bool,
    pub sql_pools: &'a dyn Fn(&str) -> bool,
    pub local_pools: &'a dyn Fn(&str) -> bool,
    pub redis_pools: &'a dyn Fn(&str) -> bool,
    pub dirty_sinks: &'a dyn Fn(&str) -> bool,
}

impl EntitySchema {
    pub(crate) fn build(def: &EntityDef, ctx: &ValidationContext<'_>) -> Result<Self> {
        if !(ctx.sql_pools)(&def.sql_pool) {
            return Err(EngineError::SqlPoolNotRegistered { name: def.sql_pool.clone() });
        }
        if let Some(pool) = &def.local_cache {
            if !(ctx.local_pools)(pool) {
                return Err(EngineError::LocalCachePoolNotRegistered { name: pool.clone() });
            }
        }
        if let Some(pool) = &def.redis_cache {
            if !(ctx.redis_pools)(pool) {
                return Err(EngineError::RedisCachePoolNotRegistered { name: pool.clone() });
            }
        }

        let table = def.table.clone().unwrap_or_else(|| def.name.clone());
        let mut columns = def.columns.clone();
        if def.fake_delete {
            columns.push(Column::new("FakeDelete", ColumnKind::Bool));
        }

        let mut ref_columns = Vec::new();
        for column in &columns {
            if column.name == "ID" {
                return Err(EngineError::InvalidConfig(format!(
                    "entity '{}' declares a reserved column 'ID'",
                    def.name
                )));
            }
            match &column.kind {
                ColumnKind::Ref { target } => {
                    if !(ctx.entities)(target) {
                        return Err(EngineError::EntityNotRegistered { name: target.clone() });
                    }
                    ref_columns.push(column.name.clone());
                }
                ColumnKind::Enum { enum_id } | ColumnKind::Set { enum_id } => {
                    if !(ctx.enums)(enum_id) {
                        return Err(EngineError::InvalidConfig(format!(
                            "unregistered enum '{}' on column '{}.{}'",
                            enum_id, def.name, column.name
                        )));
                    }
                }
                _ => {}
            }
            for sink in column.dirty_sinks() {
                if !(ctx.dirty_sinks)(sink) {
                    return Err(EngineError::InvalidConfig(format!(
                        "unregistered dirty sink '{}' on column '{}.{}'",
                        sink, def.name, column.name
                    )));
                }
            }
        }
        for sink in &def.dirty_sinks {
            if !(ctx.dirty_sinks)(sink) {
                return Err(EngineError::InvalidConfig(format!(
                    "unregistered dirty sink '{}' on entity '{}'",
                    sink, def.name
                )));
            }
        }

        let unique_indexes = collect_indexes(&columns, "unique")?;
        let column_names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let columns_stamp = fnv1a32(&format!("{:?}", column_names)).to_string();
        let mut cache_prefix = String::new();
        if def.sql_pool != "default" {
            cache_prefix.push_str(&def.sql_pool);
        }
        cache_prefix.push_str(&table);

        let mut cached_indexes = IndexMap::new();
        let mut cached_indexes_one = IndexMap::new();
        for query in &def.queries {
            let index = parse_query_template(query, def.fake_delete, &columns, &def.name)?;
            if query.one {
                cached_indexes_one.insert(query.name.clone(), index);
            } else {
                cached_indexes.insert(query.name.clone(), index);
            }
        }

        Ok(Self {
            name: def.name.clone(),
            log_table_name: format!("_log_{}_{}", def.sql_pool, table),
            table_name: table,
            sql_pool: def.sql_pool.clone(),
            local_cache: def.local_cache.clone(),
            redis_cache: def.redis_cache.clone(),
            columns,
            cached_indexes,
            cached_indexes_one,
            unique_indexes,
            ref_columns,
            has_fake_delete: def.fake_delete,
            has_log: def.log,
            dirty_sinks: def.dirty_sinks.clone(),
            cache_prefix,
            columns_stamp,
        })
    }

    /// Column names in declaration order — the canonical SELECT order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn tags(&self, column: &str) -> Option<&IndexMap<String, String>> {
        self.column(column).map(|c| &c.tags)
    }

    /// Stable per-schema key prefix: table name plus the columns stamp.
    pub fn cache_prefix(&self) -> &str {
        &self.cache_prefix
    }

    pub fn columns_stamp(&self) -> &str {
        &self.columns_stamp
    }

    /// Row-by-ID cache key.
    pub fn cache_key(&self, id: u64) -> String {
        format!("{}{}:{}", self.cache_prefix, self.columns_stamp, id)
    }

    /// Cache key of one (cached index, arguments) combination. Arguments are
    /// canonical column strings; `None` is the NULL marker.
    pub fn search_key(&self, index_name: &str, args: &[Option<String>]) -> String {
        let parts: Vec<&str> =
            args.iter().map(|a| a.as_deref().unwrap_or("<nil>")).collect();
        let hash = fnv1a32(&format!("[{}]", parts.join(" ")));
        format!("{}_{}_{}", self.cache_prefix, index_name, hash)
    }

    pub fn cached_index(&self, name: &str) -> Option<&CachedIndex> {
        self.cached_indexes.get(name)
    }

    pub fn cached_index_one(&self, name: &str) -> Option<&CachedIndex> {
        self.cached_indexes_one.get(name)
    }

    /// Every cached index, *many* flavors first.
    pub fn all_cached_indexes(&self) -> impl Iterator<Item = &CachedIndex> {
        self.cached_indexes.values().chain(self.cached_indexes_one.values())
    }

    /// Columns that reach SQL (ignored ones skipped), declaration order.
    pub fn persisted_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_ignored())
    }

    /// SELECT list reading every column back as a string, `ID` first.
    /// `CAST(... AS CHAR)` keeps the Value Codec as the single decode path.
    pub(crate) fn select_list(&self) -> String {
        let mut list = String::from("CAST(`ID` AS CHAR)");
        for column in self.persisted_columns() {
            list.push_str(&format!(",CAST(`{}` AS CHAR)", column.name));
        }
        list
    }

    pub fn new_entity(self: &Arc<Self>) -> Entity {
        Entity::new(self.clone())
    }
}

/// Parse a `:Field = ? ORDER BY :Field` template: rewrite placeholders to
/// backticked columns and collect the tracked fields.
fn parse_query_template(
    def: &QueryDef,
    fake_delete: bool,
    columns: &[Column],
    entity: &str,
) -> Result<CachedIndex> {
    let mut query = String::new();
    let mut tracked = Vec::new();
    let mut saw_placeholder = false;
    let mut chars = def.template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != ':' {
            query.push(c);
            continue;
        }
        let mut field = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_alphanumeric() {
                field.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if field.is_empty() {
            query.push(':');
            continue;
        }
        saw_placeholder = true;
        if field != "ID" {
            if !columns.iter().any(|c| c.name == field) {
                return Err(EngineError::UnknownColumn {
                    entity: entity.to_string(),
                    column: field,
                });
            }
            if !tracked.contains(&field) {
                tracked.push(field.clone());
            }
        }
        query.push('`');
        query.push_str(&field);
        query.push('`');
    }
    if query.is_empty() {
        query = "1 ORDER BY `ID`".to_string();
    }
    let mut query_fields = tracked.clone();
    if fake_delete && saw_placeholder {
        query_fields.push("FakeDelete".to_string());
    }
    Ok(CachedIndex {
        name: def.name.clone(),
        query,
        tracked_fields: tracked,
        query_fields,
        max_rows: def.max,
        one: def.one,
    })
}

/// Collect `unique=Name[:pos]` (or `index=`) tags into ordered column lists.
fn collect_indexes(columns: &[Column], tag: &str) -> Result<IndexMap<String, Vec<String>>> {
    let mut raw: IndexMap<String, BTreeMap<u8, String>> = IndexMap::new();
    for column in columns {
        let Some(declared) = column.tags.get(tag) else { continue };
        for part in declared.split(',') {
            let (name, pos) = match part.split_once(':') {
                Some((name, pos)) => {
                    let pos: u8 = pos.parse().map_err(|_| {
                        EngineError::InvalidConfig(format!(
                            "invalid index position '{}' on column '{}'",
                            part, column.name
                        ))
                    })?;
                    (name, pos)
                }
                None => (part, 1),
            };
            raw.entry(name.to_string()).or_default().insert(pos, column.name.clone());
        }
    }
    Ok(raw
        .into_iter()
        .map(|(name, by_pos)| (name, by_pos.into_values().collect()))
        .collect())
}

/// 32-bit FNV-1a, the columns-stamp and search-key hash.
pub(crate) fn fnv1a32(data: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_all_ok() -> ValidationContext<'static> {
        fn yes(_: &str) -> bool {
            true
        }
        ValidationContext {
            entities: &yes,
            enums: &yes,
            sql_pools: &yes,
            local_pools: &yes,
            redis_pools: &yes,
            dirty_sinks: &yes,
        }
    }

    fn user_def() -> EntityDef {
        SchemaBuilder::new("UserEntity")
            .table("User")
            .column(
                Column::new("Name", ColumnKind::String { length: Some(100) })
                    .tag("unique", "NameIndex"),
            )
            .column(Column::new("Age", ColumnKind::Uint { bits: 16 }))
            .query("IndexAge", ":Age = ? ORDER BY :ID")
            .query("IndexAll", "")
            .query_one("IndexName", ":Name = ?")
            .build()
    }

    #[test]
    fn test_query_template_rewrite() {
        let schema = EntitySchema::build(&user_def(), &ctx_all_ok()).unwrap();
        let index = schema.cached_index("IndexAge").unwrap();
        assert_eq!(index.query, "`Age` = ? ORDER BY `ID`");
        assert_eq!(index.tracked_fields, vec!["Age"]);
        assert_eq!(index.max_rows, DEFAULT_CACHED_INDEX_MAX);

        let all = schema.cached_index("IndexAll").unwrap();
        assert_eq!(all.query, "1 ORDER BY `ID`");
        assert!(all.tracked_fields.is_empty());

        let one = schema.cached_index_one("IndexName").unwrap();
        assert_eq!(one.max_rows, 1);
        assert!(one.one);
    }

    #[test]
    fn test_fake_delete_joins_query_fields() {
        let mut def = user_def();
        def.fake_delete = true;
        let schema = EntitySchema::build(&def, &ctx_all_ok()).unwrap();
        let index = schema.cached_index("IndexAge").unwrap();
        assert_eq!(index.tracked_fields, vec!["Age"]);
        assert_eq!(index.query_fields, vec!["Age", "FakeDelete"]);
        // the unfiltered index has no placeholders and no FakeDelete appendix
        let all = schema.cached_index("IndexAll").unwrap();
        assert!(all.query_fields.is_empty());
        // the synthetic column is appended last
        assert_eq!(schema.columns.last().unwrap().name, "FakeDelete");
    }

    #[test]
    fn test_unknown_tracked_field_fails_validation() {
        let def = SchemaBuilder::new("Bad")
            .column(Column::new("Name", ColumnKind::String { length: None }))
            .query("IndexAge", ":Age = ?")
            .build();
        let err = EntitySchema::build(&def, &ctx_all_ok()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownColumn { .. }));
    }

    #[test]
    fn test_cache_key_format() {
        let schema = EntitySchema::build(&user_def(), &ctx_all_ok()).unwrap();
        let key = schema.cache_key(42);
        assert!(key.starts_with("User"));
        assert!(key.ends_with(":42"));
        assert_eq!(key, format!("User{}:42", schema.columns_stamp()));
    }

    #[test]
    fn test_columns_stamp_isolates_schema_revisions() {
        let old = EntitySchema::build(&user_def(), &ctx_all_ok()).unwrap();
        let mut def = user_def();
        def.columns.push(Column::new("Email", ColumnKind::String { length: None }));
        let new = EntitySchema::build(&def, &ctx_all_ok()).unwrap();
        assert_ne!(old.columns_stamp(), new.columns_stamp());
        assert_ne!(old.cache_key(1), new.cache_key(1));
    }

    #[test]
    fn test_search_key_is_stable_and_arg_sensitive() {
        let schema = EntitySchema::build(&user_def(), &ctx_all_ok()).unwrap();
        let a = schema.search_key("IndexAge", &[Some("10".to_string())]);
        let b = schema.search_key("IndexAge", &[Some("10".to_string())]);
        let c = schema.search_key("IndexAge", &[Some("18".to_string())]);
        let null = schema.search_key("IndexAge", &[None]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, null);
        assert!(a.starts_with("User_IndexAge_"));
    }

    #[test]
    fn test_unique_index_declaration_order() {
        let def = SchemaBuilder::new("E")
            .column(Column::new("A", ColumnKind::Uint { bits: 32 }).tag("unique", "Second:2,Third"))
            .column(Column::new("B", ColumnKind::Uint { bits: 64 }).tag("unique", "Second"))
            .build();
        let schema = EntitySchema::build(&def, &ctx_all_ok()).unwrap();
        let names: Vec<&String> = schema.unique_indexes.keys().collect();
        assert_eq!(names, vec!["Second", "Third"]);
        assert_eq!(schema.unique_indexes["Second"], vec!["B", "A"]);
        assert_eq!(schema.unique_indexes["Third"], vec!["A"]);
    }

    #[test]
    fn test_reserved_id_column_rejected() {
        let def = SchemaBuilder::new("E")
            .column(Column::new("ID", ColumnKind::Uint { bits: 64 }))
            .build();
        assert!(EntitySchema::build(&def, &ctx_all_ok()).is_err());
    }

    #[test]
    fn test_embed_prefixes_columns() {
        let def = SchemaBuilder::new("E")
            .embed(
                "Address",
                vec![
                    Column::new("Street", ColumnKind::String { length: None }),
                    Column::new("Building", ColumnKind::Uint { bits: 16 }),
                ],
            )
            .build();
        let schema = EntitySchema::build(&def, &ctx_all_ok()).unwrap();
        let names: Vec<&str> = schema.column_names().collect();
        assert_eq!(names, vec!["AddressStreet", "AddressBuilding"]);
    }

    #[test]
    fn test_select_list_casts_every_column() {
        let schema = EntitySchema::build(&user_def(), &ctx_all_ok()).unwrap();
        assert_eq!(
            schema.select_list(),
            "CAST(`ID` AS CHAR),CAST(`Name` AS CHAR),CAST(`Age` AS CHAR)"
        );
    }

    #[test]
    fn test_fnv1a32_known_vector() {
        // standard FNV-1a test vectors
        assert_eq!(fnv1a32(""), 0x811c9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c292c);
    }
}
