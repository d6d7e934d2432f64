//! Transport seam between the reconnecting consumer and the AMQP client.
//!
//! [`ResilientConsumer`](super::ResilientConsumer) only talks to these traits;
//! [`RabbitMqBroker`](super::RabbitMqBroker) is the lapin-backed implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::channel::ChannelError;
use super::connection::ConnectionError;
use super::consumer::ConsumerError;
use super::delivery::Delivery;
use super::watcher::FailureWatcher;

pub type DeliveryStream = BoxStream<'static, Result<Delivery, ConsumerError>>;

/// Queue declaration arguments. Sent identically on every reconnect cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
    pub nowait: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            passive: false,
            nowait: false,
        }
    }
}

/// Consumption registration arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeSpec {
    /// Empty lets the broker generate a tag.
    pub consumer_tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub nowait: bool,
}

impl Default for ConsumeSpec {
    fn default() -> Self {
        Self {
            consumer_tag: String::new(),
            no_ack: true,
            exclusive: false,
            no_local: false,
            nowait: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Dials the broker. One call yields one connection with one channel open.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Session: BrokerSession;

    async fn connect(&self, uri: &str) -> Result<Self::Session, ConnectionError>;
}

/// A live connection plus its channel.
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue, ChannelError>;

    async fn consume(
        &self,
        queue: &DeclaredQueue,
        spec: &ConsumeSpec,
    ) -> Result<DeliveryStream, ConsumerError>;

    /// Arms a fresh one-shot watcher for this session's connection.
    fn failure_watcher(&self) -> FailureWatcher;
}
