use async_trait::async_trait;
use lapin::{Channel, Connection, ConnectionProperties};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use super::broker::{
    Broker, BrokerSession, ConsumeSpec, DeclaredQueue, DeliveryStream, QueueSpec,
};
use super::channel::{ChannelError, ChannelProvider};
use super::consumer::ConsumerError;
use super::watcher::{
    close_on_stream_end, failure_watch, CloseNotifier, ConnectionClosed, FailureWatcher,
};

/// Where to connect and what to consume. Fixed for the life of the process.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    uri: String,
    queue_name: String,
}

impl ConnectionDescriptor {
    pub fn new(uri: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            queue_name: queue_name.into(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

// The URI carries credentials.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("uri", &"<redacted>")
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

/// lapin-backed [`Broker`].
#[derive(Clone, Default)]
pub struct RabbitMqBroker {
    properties: ConnectionProperties,
}

impl RabbitMqBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    type Session = RabbitMqConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Session, ConnectionError> {
        RabbitMqConnection::connect(uri, self.properties.clone()).await
    }
}

/// One connection and the single channel opened over it.
pub struct RabbitMqConnection {
    connection: Connection,
    channel: Channel,
    close_notifier: Mutex<Option<Arc<CloseNotifier>>>,
}

impl RabbitMqConnection {
    pub async fn connect(
        uri: &str,
        properties: ConnectionProperties,
    ) -> Result<Self, ConnectionError> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(uri, properties).await.map_err(|e| {
            error!(error = %e, "Failed to connect to RabbitMQ");
            ConnectionError::ConnectionFailed(e.to_string())
        })?;

        let channel = ChannelProvider::create_channel(&connection).await?;

        info!(channel_id = channel.id(), "Successfully connected to RabbitMQ");

        Ok(Self {
            connection,
            channel,
            close_notifier: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl BrokerSession for RabbitMqConnection {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue, ChannelError> {
        ChannelProvider::declare_queue(&self.channel, spec).await
    }

    async fn consume(
        &self,
        queue: &DeclaredQueue,
        spec: &ConsumeSpec,
    ) -> Result<DeliveryStream, ConsumerError> {
        let deliveries = ChannelProvider::subscribe(&self.channel, queue, spec).await?;

        // lapin only reports protocol errors through `on_error`; a clean
        // Connection.Close from the broker just ends the consumer stream.
        let notifier = match self.close_notifier.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        Ok(match notifier {
            Some(notifier) => {
                let status = self.connection.status().clone();
                close_on_stream_end(deliveries, notifier, move || !status.connected())
            }
            None => deliveries,
        })
    }

    fn failure_watcher(&self) -> FailureWatcher {
        let (notifier, watcher) = failure_watch();
        let notifier = Arc::new(notifier);

        match self.close_notifier.lock() {
            Ok(mut slot) => *slot = Some(notifier.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(notifier.clone()),
        }

        if !self.is_connected() {
            warn!("Connection already closed while arming failure watcher");
            notifier.notify(ConnectionClosed::with_reason("connection not connected"));
            return watcher;
        }

        self.connection.on_error(move |e| {
            notifier.notify(ConnectionClosed::with_reason(e.to_string()));
        });

        watcher
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
