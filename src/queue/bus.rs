//! AMQP message-bus surface.
//!
//! Thin wrapper over `lapin` exposing exactly what the engine needs:
//! durable queue declaration, exchanges (direct/topic/fanout/headers) with
//! the optional delayed-message extension (`x-delayed-type` argument),
//! publishing with a routing key, and a batching consumer with explicit
//! prefetch and one manual ack per batch.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::debug;

use crate::error::Result;
use crate::retry::{retry, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl RouterKind {
    fn as_str(self) -> &'static str {
        match self {
            RouterKind::Direct => "direct",
            RouterKind::Topic => "topic",
            RouterKind::Fanout => "fanout",
            RouterKind::Headers => "headers",
        }
    }
}

/// Exchange bound in front of a queue.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub name: String,
    pub kind: RouterKind,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// Consumer prefetch; also the batch size of [`BusConsumer::next_batch`].
    pub prefetch: u16,
    pub router: Option<RouterConfig>,
    pub router_keys: Vec<String>,
    /// Declare the exchange as `x-delayed-message` carrying the real kind in
    /// the `x-delayed-type` argument.
    pub delayed: bool,
}

impl QueueConfig {
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            auto_delete: false,
            prefetch: 1,
            router: None,
            router_keys: Vec::new(),
            delayed: false,
        }
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn router(mut self, name: &str, kind: RouterKind) -> Self {
        self.router = Some(RouterConfig { name: name.to_string(), kind });
        self
    }

    pub fn router_keys(mut self, keys: &[&str]) -> Self {
        self.router_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn delayed(mut self) -> Self {
        self.delayed = true;
        self
    }
}

/// Shared AMQP connection; channels are created per queue handle.
#[derive(Clone)]
pub struct Bus {
    connection: Arc<Connection>,
}

impl Bus {
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = retry("bus_connect", &RetryConfig::startup(), || {
            Connection::connect(uri, ConnectionProperties::default())
        })
        .await?;
        Ok(Self { connection: Arc::new(connection) })
    }

    /// Declare a queue (and its exchange/bindings, if any) on a fresh channel.
    pub async fn queue(&self, config: QueueConfig) -> Result<BusQueue> {
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(config.prefetch, BasicQosOptions::default()).await?;

        if let Some(router) = &config.router {
            let (kind, args) = if config.delayed {
                let mut args = FieldTable::default();
                args.insert(
                    "x-delayed-type".to_string().into(),
                    AMQPValue::LongString(router.kind.as_str().to_string().into()),
                );
                (ExchangeKind::Custom("x-delayed-message".to_string()), args)
            } else {
                (
                    match router.kind {
                        RouterKind::Direct => ExchangeKind::Direct,
                        RouterKind::Topic => ExchangeKind::Topic,
                        RouterKind::Fanout => ExchangeKind::Fanout,
                        RouterKind::Headers => ExchangeKind::Headers,
                    },
                    FieldTable::default(),
                )
            };
            channel
                .exchange_declare(
                    &router.name,
                    kind,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    args,
                )
                .await?;
            debug!(exchange = %router.name, kind = router.kind.as_str(), "exchange declared");
        }

        channel
            .queue_declare(
                &config.name,
                QueueDeclareOptions {
                    durable: config.durable,
                    auto_delete: config.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(queue = %config.name, durable = config.durable, "queue declared");

        if let Some(router) = &config.router {
            let keys: Vec<String> = if config.router_keys.is_empty() {
                vec![String::new()]
            } else {
                config.router_keys.clone()
            };
            for key in keys {
                channel
                    .queue_bind(
                        &config.name,
                        &router.name,
                        &key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
            }
        }

        Ok(BusQueue { channel, config })
    }
}

pub struct BusQueue {
    channel: Channel,
    config: QueueConfig,
}

impl BusQueue {
    /// Publish to the queue (default exchange) or to the bound exchange with
    /// the queue name as routing key.
    pub async fn publish(&self, body: &[u8]) -> Result<()> {
        self.publish_routed(&self.config.name, body).await
    }

    /// Publish through the bound exchange with an explicit routing key.
    pub async fn publish_routed(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        let exchange = self.config.router.as_ref().map(|r| r.name.as_str()).unwrap_or("");
        let routing_key = if exchange.is_empty() { self.config.name.as_str() } else { routing_key };
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(())
    }

    /// Publish with the delayed-message extension; requires a delayed router.
    pub async fn publish_delayed(&self, delay: Duration, body: &[u8]) -> Result<()> {
        let exchange = self.config.router.as_ref().map(|r| r.name.as_str()).unwrap_or("");
        let mut headers = FieldTable::default();
        headers.insert(
            "x-delay".to_string().into(),
            AMQPValue::LongLongInt(delay.as_millis() as i64),
        );
        self.channel
            .basic_publish(
                exchange,
                &self.config.name,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_headers(headers),
            )
            .await?
            .await?;
        Ok(())
    }

    /// Start a consumer. Batches are bounded by the configured prefetch.
    pub async fn consumer(&self, tag: &str) -> Result<BusConsumer> {
        let consumer = self
            .channel
            .basic_consume(
                &self.config.name,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(BusConsumer { consumer, batch_size: self.config.prefetch as usize })
    }
}

pub struct BusConsumer {
    consumer: lapin::Consumer,
    batch_size: usize,
}

/// One consumed batch; acking acknowledges every delivery up to the last.
pub struct Batch {
    pub items: Vec<Vec<u8>>,
    last: Delivery,
}

impl Batch {
    pub async fn ack(self) -> Result<()> {
        self.last.ack(BasicAckOptions { multiple: true }).await?;
        Ok(())
    }
}

impl BusConsumer {
    /// Collect up to `prefetch` messages, waiting at most `idle_timeout`
    /// between them. `None` when the window closed with nothing delivered.
    pub async fn next_batch(&mut self, idle_timeout: Duration) -> Result<Option<Batch>> {
        let mut items = Vec::with_capacity(self.batch_size);
        let mut last: Option<Delivery> = None;
        while items.len() < self.batch_size {
            match tokio::time::timeout(idle_timeout, self.consumer.next()).await {
                Ok(Some(Ok(delivery))) => {
                    items.push(delivery.data.clone());
                    last = Some(delivery);
                }
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        match last {
            Some(last) => Ok(Some(Batch { items, last })),
            None => Ok(None),
        }
    }
}
