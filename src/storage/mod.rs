//! Pool backends: MySQL (sqlx), remote Redis, process-local LRU.

pub mod local;
pub mod redis;
pub mod sql;

pub use local::LocalCachePool;
pub use redis::RedisPool;
pub use sql::{ExecResult, SqlPool};
