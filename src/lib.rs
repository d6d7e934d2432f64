//! Keeps a durable subscription to one RabbitMQ queue alive and fans every
//! delivery out to a [`MessageHandler`](messaging::MessageHandler).
//!
//! Deliveries are auto-acknowledged by the broker before the handler runs, so a
//! crash between receipt and handler completion loses the message.

pub mod contracts;
pub mod messaging;
pub mod metrics;
