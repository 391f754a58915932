//! The engine: the single holder of pool handles for one unit of work.
//!
//! An [`Engine`] is created from a validated registry and serves one logical
//! request or job. It is deliberately **not** `Sync`-shareable state: the
//! transaction scope and log metadata are single-owner, which is why every
//! mutating path takes `&mut self`. Create one engine per unit of work —
//! they are cheap, the heavy pool handles are shared behind the registry.
//!
//! Reads route local cache → remote cache → SQL and repopulate the caches on
//! the way out; writes go through [`flush`](Engine::flush), which plans the
//! minimal statement set and applies the derived cache and queue effects.

pub(crate) mod cached_search;
pub(crate) mod flush;
pub(crate) mod flush_in_cache;
pub(crate) mod read;
pub(crate) mod search;

pub use search::{Pager, Where};

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{MySql, Transaction};
use tracing::debug;

use crate::dirty::dirty_bind;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::locker::Locker;
use crate::queue::bus::{Bus, BusQueue, QueueConfig};
use crate::queue::log::LOG_QUEUE_NAME;
use crate::registry::{ValidatedRegistry, DEFAULT_POOL};
use crate::schema::EntitySchema;
use crate::storage::sql::exec_on_tx;
use crate::storage::{ExecResult, LocalCachePool, RedisPool, SqlPool};

/// Deferred cache effects of an open transaction. Local-cache sets and
/// remote-cache deletes staged by flushes inside the transaction are held
/// here and replayed on commit; applying them mid-transaction would race
/// with uncommitted SQL state.
pub struct TransactionScope {
    tx: Transaction<'static, MySql>,
    pub(crate) local_sets: HashMap<String, Vec<(String, String)>>,
    pub(crate) redis_deletes: HashMap<String, Vec<String>>,
}

pub struct Engine {
    registry: Arc<ValidatedRegistry>,
    pub(crate) tx: Option<TransactionScope>,
    pub(crate) log_meta: serde_json::Map<String, serde_json::Value>,
    log_queue: Option<BusQueue>,
}

impl Engine {
    pub(crate) fn new(registry: Arc<ValidatedRegistry>) -> Self {
        Self {
            registry,
            tx: None,
            log_meta: serde_json::Map::new(),
            log_queue: None,
        }
    }

    pub fn registry(&self) -> &Arc<ValidatedRegistry> {
        &self.registry
    }

    pub fn schema(&self, entity_name: &str) -> Result<Arc<EntitySchema>> {
        self.registry.schema(entity_name)
    }

    pub fn sql(&self, code: &str) -> Result<&SqlPool> {
        self.registry
            .sql_pools
            .get(code)
            .ok_or_else(|| EngineError::SqlPoolNotRegistered { name: code.to_string() })
    }

    pub fn local_cache(&self, code: &str) -> Result<&LocalCachePool> {
        self.registry
            .local_pools
            .get(code)
            .ok_or_else(|| EngineError::LocalCachePoolNotRegistered { name: code.to_string() })
    }

    pub fn redis(&self, code: &str) -> Result<&RedisPool> {
        self.registry
            .redis_pools
            .get(code)
            .ok_or_else(|| EngineError::RedisCachePoolNotRegistered { name: code.to_string() })
    }

    pub fn bus(&self) -> Result<&Bus> {
        self.registry
            .bus
            .as_ref()
            .ok_or_else(|| EngineError::InvalidConfig("no message bus registered".to_string()))
    }

    /// Distributed lock handle backed by a registered locker pool.
    pub fn locker(&self, code: &str) -> Result<Locker> {
        let pool_code = self
            .registry
            .lockers
            .get(code)
            .ok_or_else(|| EngineError::LockerNotRegistered { name: code.to_string() })?;
        Ok(Locker::new(self.redis(pool_code)?.clone()))
    }

    /// Redis pool backing the default lazy queue.
    pub(crate) fn lazy_queue_redis(&self) -> Result<&RedisPool> {
        let code = self.registry.lazy_queue_pool().ok_or_else(|| {
            EngineError::InvalidConfig("no default lazy queue registered".to_string())
        })?;
        self.redis(code)
    }

    /// Metadata merged into every change-log record this engine emits.
    pub fn set_log_meta(&mut self, key: &str, value: serde_json::Value) {
        self.log_meta.insert(key.to_string(), value);
    }

    pub fn is_dirty(&self, entity: &Entity) -> Result<bool> {
        Ok(dirty_bind(entity)?.0)
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Open a transaction on the default SQL pool. Flushes issued before
    /// commit run their statements inside it and defer their cache effects.
    pub async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(EngineError::NotSupported("nested transactions".to_string()));
        }
        let pool = self.sql(DEFAULT_POOL)?.pool().clone();
        let tx = pool.begin().await?;
        self.tx = Some(TransactionScope {
            tx,
            local_sets: HashMap::new(),
            redis_deletes: HashMap::new(),
        });
        debug!("transaction started");
        Ok(())
    }

    /// Commit and replay the deferred cache effects.
    pub async fn commit(&mut self) -> Result<()> {
        let scope = self
            .tx
            .take()
            .ok_or_else(|| EngineError::NotSupported("commit without transaction".to_string()))?;
        scope.tx.commit().await?;
        for (cache_code, pairs) in scope.local_sets {
            self.local_cache(&cache_code)?.mset(pairs);
        }
        for (cache_code, keys) in scope.redis_deletes {
            self.redis(&cache_code)?.del(&keys).await?;
        }
        debug!("transaction committed, deferred cache effects applied");
        Ok(())
    }

    /// Roll back and drop the deferred cache effects.
    pub async fn rollback(&mut self) -> Result<()> {
        let scope = self
            .tx
            .take()
            .ok_or_else(|| EngineError::NotSupported("rollback without transaction".to_string()))?;
        scope.tx.rollback().await?;
        debug!("transaction rolled back");
        Ok(())
    }

    /// Execute a write statement, routing through the open transaction when
    /// the target is the default pool.
    pub(crate) async fn exec(
        &mut self,
        pool_code: &str,
        sql: &str,
        params: &[Option<String>],
    ) -> Result<ExecResult> {
        if pool_code == DEFAULT_POOL {
            if let Some(scope) = self.tx.as_mut() {
                return exec_on_tx(&mut scope.tx, pool_code, sql, params).await;
            }
        }
        self.sql(pool_code)?.exec(sql, params).await
    }

    pub(crate) async fn ensure_log_queue(&mut self) -> Result<&BusQueue> {
        if self.log_queue.is_none() {
            let bus = self.bus()?.clone();
            self.log_queue = Some(bus.queue(QueueConfig::durable(LOG_QUEUE_NAME)).await?);
        }
        Ok(self.log_queue.as_ref().expect("just created"))
    }
}
