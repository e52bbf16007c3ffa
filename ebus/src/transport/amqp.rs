use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, StreamExt};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use parking_lot::Mutex;

use ebus_conf::ExchangeType;

use super::{Delivery, DeliveryStream, Envelope, Transport, CONTENT_TYPE};
use crate::{BusError, Result};

const REPLY_SUCCESS: u16 = 200;

/// AMQP 0-9-1 transport over a single connection and channel.
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    consumer_tag: Mutex<Option<ShortString>>,
}

impl AmqpTransport {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let connection = Connection::connect(dsn, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::msg(format!("Failed to connect rabbitmq, {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::msg(format!("Failed to create channel rabbitmq, {e}")))?;
        log::debug!("rabbitmq channel {} opened", channel.id());
        Ok(Self { connection, channel, consumer_tag: Mutex::new(None) })
    }

    #[inline]
    fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Headers => ExchangeKind::Headers,
        }
    }

    fn into_delivery(d: lapin::message::Delivery) -> Delivery {
        Delivery {
            topic: d.routing_key.as_str().to_owned(),
            id: d.properties.message_id().as_ref().map(|id| id.as_str().to_owned()),
            body: Bytes::from(d.data),
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                Self::exchange_kind(kind),
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(name, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        //The consumer of a faulted incarnation is still registered on the broker, cancel it first.
        let previous = self.consumer_tag.lock().take();
        if let Some(tag) = previous {
            if let Err(e) = self.channel.basic_cancel(tag.as_str(), BasicCancelOptions::default()).await {
                log::warn!("cancel previous consumer {tag:?} error, {e}");
            }
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions { no_ack: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        *self.consumer_tag.lock() = Some(consumer.tag());

        let stream = consumer
            .take_while(|d| {
                if let Err(e) = d {
                    log::warn!("rabbitmq consumer stream error, {e}");
                }
                future::ready(d.is_ok())
            })
            .filter_map(|d| future::ready(d.ok().map(Self::into_delivery)));
        Ok(stream.boxed())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE))
            .with_message_id(ShortString::from(envelope.id.as_str()));
        self.channel
            .basic_publish(exchange, &envelope.topic, BasicPublishOptions::default(), &envelope.body, properties)
            .await?
            .await?;
        Ok(())
    }

    async fn close_channel(&self) -> Result<()> {
        self.channel.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        self.connection.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}
