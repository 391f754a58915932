//! YAML configuration loading.
//!
//! The document carries a top-level `orm:` mapping; each sub-key names a
//! pool and maps one of `mysql`, `redis`, `localCache`, `lazyQueue` or
//! `dirtyQueue`. Unknown keys fail validation.
//!
//! ```yaml
//! orm:
//!   default:
//!     mysql: root:root@tcp(localhost:3306)/test
//!     redis: localhost:6379:0
//!     localCache: 1000
//!   queues:
//!     lazyQueue: default
//!     dirtyQueue: default
//! ```

use serde_yaml::Value;

use crate::error::{EngineError, Result};
use crate::registry::Registry;

impl Registry {
    /// Build a registry from a YAML document. Entities and enumerations are
    /// registered separately; this covers the pool topology.
    pub fn from_yaml(document: &str) -> Result<Registry> {
        let root: Value = serde_yaml::from_str(document)
            .map_err(|e| EngineError::InvalidConfig(format!("invalid yaml: {}", e)))?;
        let orm = root
            .get("orm")
            .ok_or_else(|| EngineError::InvalidConfig("missing orm section".to_string()))?;
        let orm = orm
            .as_mapping()
            .ok_or_else(|| EngineError::InvalidConfig("invalid orm section".to_string()))?;

        let mut registry = Registry::new();
        for (pool_key, pool_config) in orm {
            let pool_name = pool_key
                .as_str()
                .ok_or_else(|| EngineError::InvalidConfig("invalid pool name".to_string()))?;
            let mapping = pool_config.as_mapping().ok_or_else(|| {
                EngineError::InvalidConfig(format!("invalid pool section '{}'", pool_name))
            })?;
            for (key, value) in mapping {
                let key = key.as_str().ok_or_else(|| {
                    EngineError::InvalidConfig(format!("invalid key in pool '{}'", pool_name))
                })?;
                match key {
                    "mysql" => {
                        registry.register_sql_pool(pool_name, expect_str(key, pool_name, value)?);
                    }
                    "redis" => {
                        let uri = expect_str(key, pool_name, value)?;
                        let (address, db) = parse_redis_uri(uri, pool_name)?;
                        registry.register_redis_pool(pool_name, address, db);
                    }
                    "localCache" => {
                        let size = value.as_u64().ok_or_else(|| {
                            EngineError::InvalidConfig(format!(
                                "invalid localCache size in pool '{}'",
                                pool_name
                            ))
                        })?;
                        registry.register_local_cache(pool_name, size as usize);
                    }
                    "lazyQueue" => {
                        registry
                            .register_lazy_queue(pool_name, expect_str(key, pool_name, value)?);
                    }
                    "dirtyQueue" => {
                        registry
                            .register_dirty_sink(pool_name, expect_str(key, pool_name, value)?);
                    }
                    other => {
                        return Err(EngineError::InvalidConfig(format!(
                            "invalid key '{}' in orm section '{}'",
                            other, pool_name
                        )));
                    }
                }
            }
        }
        Ok(registry)
    }
}

fn expect_str<'a>(key: &str, pool: &str, value: &'a Value) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        EngineError::InvalidConfig(format!("invalid {} value in pool '{}'", key, pool))
    })
}

/// `host:port:db` -> (`host:port`, db)
fn parse_redis_uri<'a>(uri: &'a str, pool: &str) -> Result<(&'a str, i64)> {
    let (address, db) = uri.rsplit_once(':').ok_or_else(|| {
        EngineError::InvalidConfig(format!("invalid redis uri '{}' in pool '{}'", uri, pool))
    })?;
    let db: i64 = db.parse().map_err(|_| {
        EngineError::InvalidConfig(format!("invalid redis uri '{}' in pool '{}'", uri, pool))
    })?;
    if !address.contains(':') {
        return Err(EngineError::InvalidConfig(format!(
            "invalid redis uri '{}' in pool '{}'",
            uri, pool
        )));
    }
    Ok((address, db))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_document() {
        let registry = Registry::from_yaml(
            r#"
orm:
  default:
    mysql: root:root@tcp(localhost:3306)/test
    redis: localhost:6379:0
    localCache: 1000
  queues:
    lazyQueue: default
    dirtyQueue: default
"#,
        );
        assert!(registry.is_ok());
    }

    #[test]
    fn test_missing_orm_section() {
        let err = Registry::from_yaml("other: {}").unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_key_fails() {
        let err = Registry::from_yaml(
            r#"
orm:
  default:
    mongo: localhost
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("mongo"));
    }

    #[test]
    fn test_redis_uri_parsing() {
        assert_eq!(parse_redis_uri("localhost:6379:3", "p").unwrap(), ("localhost:6379", 3));
        assert!(parse_redis_uri("localhost", "p").is_err());
        assert!(parse_redis_uri("localhost:6379:x", "p").is_err());
    }
}
