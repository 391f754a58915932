//! Error taxonomy for the entity engine.
//!
//! Validation errors surface from [`Registry::validate`](crate::registry::Registry::validate);
//! runtime errors surface from the offending call (`flush`, `cached_search`, ...).
//! Driver and bus errors are passed through unchanged; MySQL duplicate-key and
//! foreign-key violations are promoted to structured variants exposing the
//! offending index or constraint name.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("entity '{name}' is not registered")]
    EntityNotRegistered { name: String },

    #[error("sql pool '{name}' is not registered")]
    SqlPoolNotRegistered { name: String },

    #[error("local cache pool '{name}' is not registered")]
    LocalCachePoolNotRegistered { name: String },

    #[error("redis cache pool '{name}' is not registered")]
    RedisCachePoolNotRegistered { name: String },

    #[error("locker '{name}' is not registered")]
    LockerNotRegistered { name: String },

    /// MySQL error 1062. `index` is parsed from the driver message.
    #[error("{message}")]
    DuplicatedKey { index: String, message: String },

    /// MySQL error 1451/1452. `constraint` is parsed from the driver message.
    #[error("{message}")]
    ForeignKey { constraint: String, message: String },

    #[error("entity '{name}' [{id}] is not loaded and can't be updated")]
    NotLoaded { name: String, id: u64 },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown column '{column}' in entity '{entity}'")]
    UnknownColumn { entity: String, column: String },

    #[error("lock '{key}' not obtained within {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Bus(#[from] lapin::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
