//! # Message Fabric
//!
//! The pipeline talks to its message broker through two traits:
//!
//! - [`Connector`] opens a [`Channel`]; it may fail, and
//!   [`BrokerClient::connect`] retries it with a [`Backoff`].
//! - [`Channel`] publishes, receives, acknowledges and rejects.
//!
//! [`BrokerClient`] adds the pipeline's conventions on top: prefetch of one,
//! JSON bodies with persistent delivery and correlation ids, and one tracing
//! span per consumed message. [`AmqpConnector`] talks to an AMQP server;
//! [`MemoryBroker`] is an in-process implementation with AMQP-like routing.

use std::future::Future;

mod amqp;
mod backoff;
mod client;
mod memory;

pub use amqp::{AmqpChannel, AmqpConnector};
pub use backoff::Backoff;
pub use client::{BrokerClient, Outcome};
pub use memory::{MemoryBroker, MemoryChannel, Published};

use crate::config::{CONTENT_TYPE, DELIVERY_MODE_PERSISTENT};

/// Failures of the message fabric.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection to the broker failed: {0}")]
    ConnectionFailed(String),

    #[error("gave up connecting to the broker after {0} attempts")]
    ConnectionExhausted(u32),

    #[error("not connected to the broker")]
    NotConnected,

    #[error("unknown queue {0}")]
    UnknownQueue(String),

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),

    #[error("broker refused the operation: {0}")]
    Protocol(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BrokerError {
    /// Returns whether reconnecting may help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::NotConnected)
    }
}

/// Message properties the pipeline sets and reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Properties {
    pub content_type: String,
    pub delivery_mode: u8,
    pub correlation_id: Option<String>,
}

impl Properties {
    /// Properties of a JSON message published by the pipeline.
    #[must_use]
    pub fn json(correlation_id: impl Into<String>) -> Self {
        Self { content_type: CONTENT_TYPE.to_owned(), delivery_mode: DELIVERY_MODE_PERSISTENT, correlation_id: Some(correlation_id.into()) }
    }
}

impl Default for Properties {
    fn default() -> Self {
        Self { content_type: CONTENT_TYPE.to_owned(), delivery_mode: DELIVERY_MODE_PERSISTENT, correlation_id: None }
    }
}

/// A message handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub properties: Properties,
    pub redelivered: bool,
}

/// Opens channels to a broker.
pub trait Connector: Send + Sync {
    type Channel: Channel;

    fn connect(&self) -> impl Future<Output = Result<Self::Channel, BrokerError>> + Send;
}

/// One channel to a broker.
pub trait Channel: Send + Sync {
    /// Limits the number of unacknowledged deliveries.
    fn set_prefetch(&self, count: u16) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>, properties: Properties) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Waits for the next delivery; `None` once the queue is closed and drained.
    fn next(&self, queue: &str) -> impl Future<Output = Result<Option<Delivery>, BrokerError>> + Send;

    fn ack(&self, tag: u64) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn reject(&self, tag: u64, requeue: bool) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
