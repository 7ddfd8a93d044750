//! AMQP 0-9-1 transport over `lapin`.
//!
//! One connection carries one channel. The consumer for a queue is started
//! on the first [`Channel::next`] call for it and kept for the life of the
//! channel.

use futures_lite::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, Consumer};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, Channel, Connector, Delivery, Properties};
use crate::config::{CONTENT_TYPE, DELIVERY_MODE_PERSISTENT};

impl From<lapin::Error> for BrokerError {
    fn from(error: lapin::Error) -> Self {
        match &error {
            lapin::Error::IOError(_) | lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) | lapin::Error::MissingHeartbeatError => {
                Self::ConnectionFailed(error.to_string())
            }
            // Refusals by the server (unknown queue, access denied) do not go away by reconnecting.
            _ => Self::Protocol(error.to_string()),
        }
    }
}

/// Connects to an AMQP server, e.g. `amqp://user:pass@mq:5672/%2F`.
pub struct AmqpConnector {
    url: SecretString,
    consumer_tag: String,
}

impl AmqpConnector {
    pub fn new(url: SecretString, consumer_tag: impl Into<String>) -> Self {
        Self { url, consumer_tag: consumer_tag.into() }
    }
}

impl Connector for AmqpConnector {
    type Channel = AmqpChannel;

    async fn connect(&self) -> Result<AmqpChannel, BrokerError> {
        let connection = Connection::connect(self.url.expose_secret(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        info!(channel = channel.id(), "AMQP channel open");

        Ok(AmqpChannel { _connection: connection, channel, consumer_tag: self.consumer_tag.clone(), consumer: Mutex::new(None) })
    }
}

/// A channel on an AMQP connection.
pub struct AmqpChannel {
    // Closing the connection closes the channel.
    _connection: Connection,
    channel: lapin::Channel,
    consumer_tag: String,
    consumer: Mutex<Option<(String, Consumer)>>,
}

impl Channel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>, properties: Properties) -> Result<(), BrokerError> {
        self.channel.basic_publish(exchange, routing_key, BasicPublishOptions::default(), &body, to_amqp(properties)).await?.await?;
        Ok(())
    }

    async fn next(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut slot = self.consumer.lock().await;
        if slot.as_ref().is_none_or(|(consumed, _)| consumed != queue) {
            let consumer = self.channel.basic_consume(queue, &self.consumer_tag, BasicConsumeOptions::default(), FieldTable::default()).await?;
            debug!(queue, tag = %self.consumer_tag, "consumer started");
            *slot = Some((queue.to_owned(), consumer));
        }
        let Some((_, consumer)) = slot.as_mut() else {
            return Ok(None);
        };

        match consumer.next().await {
            Some(delivery) => {
                let delivery = delivery?;
                Ok(Some(Delivery { tag: delivery.delivery_tag, properties: from_amqp(&delivery.properties), redelivered: delivery.redelivered, body: delivery.data }))
            }
            // A consumer stream also ends when its channel dies.
            None if !self.channel.status().connected() => Err(BrokerError::ConnectionFailed("channel closed".to_owned())),
            None => {
                warn!(queue, "consumer canceled by the server");
                Ok(None)
            }
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), BrokerError> {
        self.channel.basic_ack(tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel.basic_reject(tag, BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

fn to_amqp(properties: Properties) -> BasicProperties {
    let amqp = BasicProperties::default().with_content_type(properties.content_type.into()).with_delivery_mode(properties.delivery_mode);
    match properties.correlation_id {
        Some(correlation_id) => amqp.with_correlation_id(correlation_id.into()),
        None => amqp,
    }
}

fn from_amqp(properties: &BasicProperties) -> Properties {
    Properties {
        content_type: properties.content_type().as_ref().map_or_else(|| CONTENT_TYPE.to_owned(), |value| value.as_str().to_owned()),
        delivery_mode: (*properties.delivery_mode()).unwrap_or(DELIVERY_MODE_PERSISTENT),
        correlation_id: properties.correlation_id().as_ref().map(|value| value.as_str().to_owned()),
    }
}
