pub mod broker;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod dispatch;
pub mod handler;
pub mod watcher;

#[cfg(test)]
pub(crate) mod fake;

pub use broker::{Broker, BrokerSession, ConsumeSpec, DeclaredQueue, DeliveryStream, QueueSpec};
pub use channel::{ChannelError, ChannelProvider};
pub use connection::{ConnectionDescriptor, ConnectionError, RabbitMqBroker, RabbitMqConnection};
pub use consumer::{
    ConnectError, ConsumerError, ConsumerHandle, ConsumerState, ResilientConsumer,
    DEFAULT_RECONNECT_DELAY, MIN_RECONNECT_DELAY,
};
pub use delivery::Delivery;
pub use dispatch::{DispatchLoop, DispatchMode};
pub use handler::{handler_fn, FnHandler, HandlerError, MessageHandler};
pub use watcher::{failure_watch, CloseNotifier, ConnectionClosed, FailureWatcher};
