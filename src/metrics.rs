//! Metrics instrumentation.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! application chooses the exporter.
//!
//! # Metric Naming Convention
//! - `entity_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `pool`: the configured pool code
//! - `tier`: local, redis
//! - `op`: exec, fetch, get, mget, publish

use metrics::{counter, histogram};
use std::time::Duration;

/// Record one SQL statement against a pool.
pub fn record_sql(pool: &str, op: &str, duration: Duration) {
    counter!(
        "entity_engine_sql_statements_total",
        "pool" => pool.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
    histogram!(
        "entity_engine_sql_seconds",
        "pool" => pool.to_string(),
        "op" => op.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a cache lookup outcome for one tier.
pub fn record_cache(pool: &str, tier: &str, hit: bool) {
    counter!(
        "entity_engine_cache_lookups_total",
        "pool" => pool.to_string(),
        "tier" => tier.to_string(),
        "status" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record a queue publish (lazy, dirty sink or change-log).
pub fn record_queue_publish(queue: &str, count: usize) {
    counter!(
        "entity_engine_queue_published_total",
        "queue" => queue.to_string()
    )
    .increment(count as u64);
}

/// Record a completed flush.
pub fn record_flush(entities: usize, duration: Duration) {
    counter!("entity_engine_flushes_total").increment(1);
    counter!("entity_engine_flushed_entities_total").increment(entities as u64);
    histogram!("entity_engine_flush_seconds").record(duration.as_secs_f64());
}
