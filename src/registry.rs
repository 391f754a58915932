//! Entity and pool registration.
//!
//! A [`Registry`] collects entity definitions, enumerations and pool
//! configurations, then freezes into a [`ValidatedRegistry`]: schemas are
//! built and cross-checked, the reverse-reference usage index is derived and
//! pool handles are established. The validated registry is read-only,
//! `Send + Sync`, and shared by every [`Engine`](crate::engine::Engine)
//! created from it. Validation is the single place configuration errors
//! surface.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::info;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::queue::bus::Bus;
use crate::schema::{EntityDef, EntitySchema, ValidationContext};
use crate::storage::{LocalCachePool, RedisPool, SqlPool};
use crate::value::ColumnKind;

/// Pool code used when none is given.
pub const DEFAULT_POOL: &str = "default";

#[derive(Default, Debug)]
pub struct Registry {
    entities: Vec<EntityDef>,
    enums: IndexMap<String, Vec<String>>,
    sql_pools: IndexMap<String, String>,
    redis_pools: IndexMap<String, (String, i64)>,
    local_pools: IndexMap<String, usize>,
    dirty_sinks: IndexMap<String, String>,
    lazy_queues: IndexMap<String, String>,
    lockers: IndexMap<String, String>,
    bus_uri: Option<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&mut self, def: EntityDef) {
        self.entities.push(def);
    }

    pub fn register_enum(&mut self, name: &str, values: &[&str]) {
        self.enums.insert(name.to_string(), values.iter().map(|v| v.to_string()).collect());
    }

    pub fn register_sql_pool(&mut self, code: &str, dsn: &str) {
        self.sql_pools.insert(code.to_string(), dsn.to_string());
    }

    /// `address` is `host:port`; `db` the redis database index.
    pub fn register_redis_pool(&mut self, code: &str, address: &str, db: i64) {
        self.redis_pools.insert(code.to_string(), (address.to_string(), db));
    }

    pub fn register_local_cache(&mut self, code: &str, size: usize) {
        self.local_pools.insert(code.to_string(), size);
    }

    /// A dirty fan-out sink backed by the given redis pool.
    pub fn register_dirty_sink(&mut self, sink: &str, redis_pool: &str) {
        self.dirty_sinks.insert(sink.to_string(), redis_pool.to_string());
    }

    /// The lazy write-behind queue backed by the given redis pool. Only the
    /// `default` queue receives lazy flushes.
    pub fn register_lazy_queue(&mut self, code: &str, redis_pool: &str) {
        self.lazy_queues.insert(code.to_string(), redis_pool.to_string());
    }

    pub fn register_locker(&mut self, code: &str, redis_pool: &str) {
        self.lockers.insert(code.to_string(), redis_pool.to_string());
    }

    /// AMQP connection for the change-log queue and bus consumers.
    pub fn register_bus(&mut self, uri: &str) {
        self.bus_uri = Some(uri.to_string());
    }

    /// Freeze the registry: build and cross-check every schema, derive the
    /// reverse-reference usage index and establish pool handles.
    pub async fn validate(self) -> Result<Arc<ValidatedRegistry>> {
        let mut names: Vec<String> = Vec::with_capacity(self.entities.len());
        for def in &self.entities {
            if names.contains(&def.name) {
                return Err(EngineError::InvalidConfig(format!(
                    "entity '{}' registered twice",
                    def.name
                )));
            }
            names.push(def.name.clone());
        }

        let entity_names = names.clone();
        let enums = self.enums.clone();
        let sql_pools = self.sql_pools.clone();
        let local_pools = self.local_pools.clone();
        let redis_pools = self.redis_pools.clone();
        let dirty_sinks = self.dirty_sinks.clone();
        let has_entity = move |name: &str| entity_names.iter().any(|n| n == name);
        let has_enum = move |name: &str| enums.contains_key(name);
        let has_sql = move |name: &str| sql_pools.contains_key(name);
        let has_local = move |name: &str| local_pools.contains_key(name);
        let has_redis = move |name: &str| redis_pools.contains_key(name);
        let has_sink = move |name: &str| dirty_sinks.contains_key(name);
        let ctx = ValidationContext {
            entities: &has_entity,
            enums: &has_enum,
            sql_pools: &has_sql,
            local_pools: &has_local,
            redis_pools: &has_redis,
            dirty_sinks: &has_sink,
        };

        let mut schemas = Vec::with_capacity(self.entities.len());
        let mut by_name = HashMap::new();
        for def in &self.entities {
            let schema = Arc::new(EntitySchema::build(def, &ctx)?);
            by_name.insert(schema.name.clone(), schemas.len());
            schemas.push(schema);
        }

        // reverse-reference index: who points at whom, and through which column
        let mut usage: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for schema in &schemas {
            for column in &schema.columns {
                if let ColumnKind::Ref { target } = &column.kind {
                    usage
                        .entry(target.clone())
                        .or_default()
                        .push((schema.name.clone(), column.name.clone()));
                }
            }
        }

        for (sink, pool) in &self.dirty_sinks {
            if !self.redis_pools.contains_key(pool) {
                return Err(EngineError::InvalidConfig(format!(
                    "dirty sink '{}' names unregistered redis pool '{}'",
                    sink, pool
                )));
            }
        }
        for (queue, pool) in &self.lazy_queues {
            if !self.redis_pools.contains_key(pool) {
                return Err(EngineError::InvalidConfig(format!(
                    "lazy queue '{}' names unregistered redis pool '{}'",
                    queue, pool
                )));
            }
        }
        for (locker, pool) in &self.lockers {
            if !self.redis_pools.contains_key(pool) {
                return Err(EngineError::InvalidConfig(format!(
                    "locker '{}' names unregistered redis pool '{}'",
                    locker, pool
                )));
            }
        }

        let mut sql = HashMap::new();
        for (code, dsn) in &self.sql_pools {
            sql.insert(code.clone(), SqlPool::connect_lazy(code, dsn)?);
        }
        let mut local = HashMap::new();
        for (code, size) in &self.local_pools {
            local.insert(code.clone(), LocalCachePool::new(code, *size));
        }
        let mut redis = HashMap::new();
        for (code, (address, db)) in &self.redis_pools {
            redis.insert(code.clone(), RedisPool::connect(code, address, *db).await?);
        }
        let bus = match &self.bus_uri {
            Some(uri) => Some(Bus::connect(uri).await?),
            None => None,
        };

        info!(
            entities = schemas.len(),
            sql_pools = sql.len(),
            redis_pools = redis.len(),
            local_pools = local.len(),
            "registry validated"
        );

        Ok(Arc::new(ValidatedRegistry {
            schemas,
            by_name,
            enums: self.enums,
            usage,
            sql_pools: sql,
            local_pools: local,
            redis_pools: redis,
            dirty_sinks: self.dirty_sinks,
            lazy_queues: self.lazy_queues,
            lockers: self.lockers,
            bus,
        }))
    }
}

/// Frozen registration: schemas, enumerations and connected pool handles.
pub struct ValidatedRegistry {
    schemas: Vec<Arc<EntitySchema>>,
    by_name: HashMap<String, usize>,
    enums: IndexMap<String, Vec<String>>,
    usage: HashMap<String, Vec<(String, String)>>,
    pub(crate) sql_pools: HashMap<String, SqlPool>,
    pub(crate) local_pools: HashMap<String, LocalCachePool>,
    pub(crate) redis_pools: HashMap<String, RedisPool>,
    pub(crate) dirty_sinks: IndexMap<String, String>,
    pub(crate) lazy_queues: IndexMap<String, String>,
    pub(crate) lockers: IndexMap<String, String>,
    pub(crate) bus: Option<Bus>,
}

impl ValidatedRegistry {
    pub fn schema(&self, entity_name: &str) -> Result<Arc<EntitySchema>> {
        self.by_name
            .get(entity_name)
            .map(|&idx| self.schemas[idx].clone())
            .ok_or_else(|| EngineError::EntityNotRegistered { name: entity_name.to_string() })
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.schemas.iter()
    }

    pub fn enum_values(&self, enum_id: &str) -> Option<&[String]> {
        self.enums.get(enum_id).map(Vec::as_slice)
    }

    /// Entities holding a reference column pointing at `entity_name`, as
    /// `(referer entity, column)` pairs.
    pub fn usage_of(&self, entity_name: &str) -> &[(String, String)] {
        self.usage.get(entity_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dirty_sinks(&self) -> impl Iterator<Item = (&str, &str)> {
        self.dirty_sinks.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Redis pool backing the default lazy queue, if one is registered.
    pub(crate) fn lazy_queue_pool(&self) -> Option<&str> {
        self.lazy_queues.get(DEFAULT_POOL).map(String::as_str)
    }

    /// Create an engine bound to this registry. Engines are cheap: they hold
    /// clones of the shared pool handles plus their own tracking state, and
    /// each serves one logical unit of work.
    pub fn create_engine(self: &Arc<Self>) -> Engine {
        Engine::new(self.clone())
    }
}
