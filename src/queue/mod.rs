//! Asynchronous reconciliation: the lazy write-behind queue, dirty fan-out
//! sinks, the change-log queue and the flush-in-cache reconcile loop.

pub mod bus;
pub mod dirty;
pub mod flush_in_cache;
pub mod lazy;
pub mod log;

pub use bus::{Bus, BusConsumer, BusQueue, QueueConfig, RouterKind};
pub use dirty::{DirtyData, DirtyReceiver};
pub use flush_in_cache::{FlushInCacheReceiver, FLUSH_IN_CACHE_SET};
pub use lazy::{LazyPayload, LazyQuery, LazyReceiver, LAZY_QUEUE_KEY};
pub use log::{LogQueueValue, LogReceiver, LOG_QUEUE_NAME};
