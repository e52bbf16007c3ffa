//! Broker transport boundary.
//!
//! A [`Transport`] owns the broker connection and channel. The bus client only
//! ever talks to the broker through this trait, which keeps the publisher and
//! the consumer loop independent of the AMQP client library and lets tests run
//! against [`MemoryTransport`].

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use ebus_conf::ExchangeType;

use crate::consumer::Registry;
use crate::Result;

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::{Binding, MemoryTransport};

/// Content type attached to every published body.
pub const CONTENT_TYPE: &str = "text/plain";

/// One outbound message. The id is shared by every retry of the same publish.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub id: String,
    pub body: Bytes,
}

impl Envelope {
    #[inline]
    pub fn new<T: Into<String>, I: Into<String>>(topic: T, id: I, body: Bytes) -> Self {
        Self { topic: topic.into(), id: id.into(), body }
    }

    #[inline]
    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// One inbound message.
///
/// The transport yields it with the encrypted body; the consumer loop swaps in
/// the plaintext before handing it to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub id: Option<String>,
    pub body: Bytes,
}

impl Delivery {
    #[inline]
    pub fn new<T: Into<String>>(topic: T, id: Option<String>, body: Bytes) -> Self {
        Self { topic: topic.into(), id, body }
    }

    /// Deserializes the body as JSON.
    #[inline]
    pub fn json<'a, T: serde::Deserialize<'a>>(&'a self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    #[inline]
    pub fn id_or_default(&self) -> &str {
        self.id.as_deref().unwrap_or("-")
    }
}

/// Deliveries in the order the broker hands them out. The stream ends when the
/// channel is closed.
pub type DeliveryStream = BoxStream<'static, Delivery>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares a durable exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()>;

    /// Declares a durable queue and returns its name.
    async fn declare_queue(&self, name: &str) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Starts consuming `queue`. Deliveries are acknowledged on receipt.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Publishes one envelope to `exchange` using the envelope topic as routing key.
    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()>;

    async fn close_channel(&self) -> Result<()>;

    async fn close_connection(&self) -> Result<()>;
}

/// Exchange, queue and consumer settings of one bus client.
#[derive(Debug, Clone)]
pub struct Topology {
    pub exchange: String,
    pub kind: ExchangeType,
    pub queue: String,
    pub consumer_tag: String,
}

impl Topology {
    /// Declares the exchange and the queue, binds the queue once per registered
    /// topic and starts consuming. Every step is idempotent on the broker side.
    pub async fn declare(&self, transport: &dyn Transport, registry: &Registry) -> Result<DeliveryStream> {
        transport.declare_exchange(&self.exchange, self.kind).await.inspect_err(|e| {
            log::error!(
                "[E: {}] [Q: {}] Consumer failed to declare an exchange, {e}",
                self.exchange,
                self.queue
            )
        })?;

        let queue = transport.declare_queue(&self.queue).await.inspect_err(|e| {
            log::error!("[E: {}] [Q: {}] Consumer failed to declare a queue, {e}", self.exchange, self.queue)
        })?;

        for topic in registry.topics() {
            transport.bind_queue(&queue, &self.exchange, topic).await.inspect_err(|e| {
                log::error!(
                    "[E: {}] [Q: {}] Consumer failed to listen to topic {topic}, {e}",
                    self.exchange,
                    self.queue
                )
            })?;
            log::info!("[E: {}] [Q: {}] Consumer listening to topic: {topic}", self.exchange, self.queue);
        }

        transport.consume(&queue, &self.consumer_tag).await.inspect_err(|e| {
            log::error!("[E: {}] [Q: {}] Consumer failed to consume message, {e}", self.exchange, self.queue)
        })
    }
}
