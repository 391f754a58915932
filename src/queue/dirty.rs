//! Dirty fan-out queues.
//!
//! Each named sink is a sorted set `dirty_queue_{sink}` on its configured
//! redis pool. Members encode `{entity}:{action}:{id}` with the flush
//! timestamp as score, so a flush emits at most one record per
//! (sink, entity, id) regardless of how many tracked columns changed —
//! set semantics make the guarantee structural.
//!
//! Delivery is at-least-once: consumers pop a batch, process it, and
//! [`requeue`](DirtyReceiver::requeue) whatever failed.

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::storage::RedisPool;

/// One popped dirty record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyData {
    pub entity_name: String,
    pub id: u64,
    pub inserted: bool,
    pub updated: bool,
    pub deleted: bool,
}

impl DirtyData {
    pub(crate) fn member(entity_name: &str, action: char, id: u64) -> String {
        format!("{}:{}:{}", entity_name, action, id)
    }

    fn parse(member: &str) -> Option<DirtyData> {
        let mut parts = member.split(':');
        let entity_name = parts.next()?.to_string();
        let action = parts.next()?;
        let id: u64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || action.len() != 1 {
            return None;
        }
        Some(DirtyData {
            entity_name,
            id,
            inserted: action == "i",
            updated: action == "u",
            deleted: action == "d",
        })
    }

    fn action(&self) -> char {
        if self.inserted {
            'i'
        } else if self.updated {
            'u'
        } else {
            'd'
        }
    }
}

pub(crate) fn queue_key(sink: &str) -> String {
    format!("dirty_queue_{}", sink)
}

/// Consumer handle for one sink.
#[derive(Debug)]
pub struct DirtyReceiver {
    pub sink: String,
}

impl DirtyReceiver {
    pub fn new(sink: &str) -> Self {
        Self { sink: sink.to_string() }
    }

    pub async fn size(&self, engine: &Engine) -> Result<u64> {
        self.pool(engine)?.zcard(&queue_key(&self.sink)).await
    }

    /// Pop up to `max` records. Malformed members are dropped.
    pub async fn pop(&self, engine: &Engine, max: usize) -> Result<Vec<DirtyData>> {
        let popped = self.pool(engine)?.zpopmin(&queue_key(&self.sink), max).await?;
        Ok(popped.iter().filter_map(|(member, _)| DirtyData::parse(member)).collect())
    }

    /// Put failed records back for a later digest.
    pub async fn requeue(&self, engine: &Engine, items: &[DirtyData]) -> Result<()> {
        let pool = self.pool(engine)?;
        let key = queue_key(&self.sink);
        for item in items {
            let member = DirtyData::member(&item.entity_name, item.action(), item.id);
            pool.zadd(&key, &member, now_score()).await?;
        }
        Ok(())
    }

    fn pool<'e>(&self, engine: &'e Engine) -> Result<&'e RedisPool> {
        let pool_code = engine
            .registry()
            .dirty_sinks
            .get(&self.sink)
            .ok_or_else(|| EngineError::InvalidConfig(format!(
                "unregistered dirty sink '{}'",
                self.sink
            )))?;
        engine.redis(pool_code)
    }
}

pub(crate) fn now_score() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_roundtrip() {
        let member = DirtyData::member("UserEntity", 'u', 42);
        assert_eq!(member, "UserEntity:u:42");
        let data = DirtyData::parse(&member).unwrap();
        assert_eq!(data.entity_name, "UserEntity");
        assert_eq!(data.id, 42);
        assert!(data.updated);
        assert!(!data.inserted);
        assert!(!data.deleted);
    }

    #[test]
    fn test_parse_rejects_malformed_members() {
        assert!(DirtyData::parse("no-separators").is_none());
        assert!(DirtyData::parse("a:u").is_none());
        assert!(DirtyData::parse("a:u:notanumber").is_none());
        assert!(DirtyData::parse("a:uu:1").is_none());
        assert!(DirtyData::parse("a:u:1:extra").is_none());
    }

    #[test]
    fn test_queue_key() {
        assert_eq!(queue_key("search"), "dirty_queue_search");
    }
}
