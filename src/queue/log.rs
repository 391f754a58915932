//! Change-log queue.
//!
//! Entities flagged with `log()` emit one record per flush to the durable
//! bus queue `log_queue`: the pre-image, the changed columns, and the
//! engine's log metadata. Inserts carry the full bind as `changes` with no
//! `before`; deletes carry `before` only.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::bus::{Bus, BusConsumer, QueueConfig};

pub const LOG_QUEUE_NAME: &str = "log_queue";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogQueueValue {
    pub table: String,
    pub id: u64,
    /// Old `dbData`; `None` for inserts.
    pub before: Option<HashMap<String, Option<String>>>,
    /// Bind map of the change; `None` for deletes.
    pub changes: Option<HashMap<String, Option<String>>>,
    /// `YYYY-MM-DD HH:MM:SS`, flush wall-clock time.
    pub updated_at: String,
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Consumes change-log payloads in batches with manual ack.
#[derive(Debug)]
pub struct LogReceiver {
    pub prefetch: u16,
    pub idle_timeout: Duration,
}

impl Default for LogReceiver {
    fn default() -> Self {
        Self { prefetch: 100, idle_timeout: Duration::from_secs(1) }
    }
}

impl LogReceiver {
    pub async fn consumer(&self, bus: &Bus, tag: &str) -> Result<BusConsumer> {
        let queue = bus.queue(QueueConfig::durable(LOG_QUEUE_NAME).prefetch(self.prefetch)).await?;
        queue.consumer(tag).await
    }

    /// Process one batch. The batch is acked only after the handler
    /// succeeds, so a crashed consumer redelivers (at-least-once).
    pub async fn digest<F, Fut>(&self, consumer: &mut BusConsumer, handler: F) -> Result<bool>
    where
        F: FnOnce(Vec<LogQueueValue>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let Some(batch) = consumer.next_batch(self.idle_timeout).await? else {
            return Ok(false);
        };
        let mut values = Vec::with_capacity(batch.items.len());
        for item in &batch.items {
            values.push(serde_json::from_slice(item)?);
        }
        handler(values).await?;
        batch.ack().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let value = LogQueueValue {
            table: "_log_default_User".to_string(),
            id: 3,
            before: None,
            changes: Some(HashMap::from([
                ("Name".to_string(), Some("a".to_string())),
                ("Age".to_string(), None),
            ])),
            updated_at: "2024-05-01 10:00:00".to_string(),
            meta: Some(
                serde_json::json!({"source": "api"}).as_object().cloned().unwrap(),
            ),
        };
        let raw = serde_json::to_vec(&value).unwrap();
        let back: LogQueueValue = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.table, "_log_default_User");
        assert_eq!(back.id, 3);
        assert!(back.before.is_none());
        assert_eq!(back.changes.unwrap()["Age"], None);
        assert_eq!(back.meta.unwrap()["source"], "api");
    }
}
