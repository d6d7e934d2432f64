use futures::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection,
};
use tracing::{error, info};

use super::broker::{ConsumeSpec, DeclaredQueue, DeliveryStream, QueueSpec};
use super::consumer::ConsumerError;
use super::delivery::Delivery;

pub struct ChannelProvider;

impl ChannelProvider {
    pub async fn create_channel(connection: &Connection) -> Result<Channel, ChannelError> {
        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            ChannelError::CreationFailed(e.to_string())
        })?;

        info!(channel_id = channel.id(), "Channel created successfully");

        Ok(channel)
    }

    pub async fn declare_queue(
        channel: &Channel,
        spec: &QueueSpec,
    ) -> Result<DeclaredQueue, ChannelError> {
        let queue = channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: spec.nowait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue = %spec.name, "Failed to declare queue");
                ChannelError::DeclareFailed(e.to_string())
            })?;

        let declared = DeclaredQueue {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        };

        info!(
            queue = %declared.name,
            durable = spec.durable,
            message_count = declared.message_count,
            consumer_count = declared.consumer_count,
            "Queue declared"
        );

        Ok(declared)
    }

    pub async fn subscribe(
        channel: &Channel,
        queue: &DeclaredQueue,
        spec: &ConsumeSpec,
    ) -> Result<DeliveryStream, ConsumerError> {
        let consumer = channel
            .basic_consume(
                &queue.name,
                &spec.consumer_tag,
                BasicConsumeOptions {
                    no_local: spec.no_local,
                    no_ack: spec.no_ack,
                    exclusive: spec.exclusive,
                    nowait: spec.nowait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue = %queue.name, "Failed to register a consumer");
                ConsumerError::ConsumeFailed(e.to_string())
            })?;

        let consumer_tag = consumer.tag().as_str().to_string();
        info!(
            queue = %queue.name,
            consumer_tag = %consumer_tag,
            auto_ack = spec.no_ack,
            "Consumer registered"
        );

        let deliveries = consumer.map(move |delivery| {
            delivery
                .map(|delivery| Delivery::from_lapin(delivery, &consumer_tag))
                .map_err(|e| ConsumerError::DeliveryFailed(e.to_string()))
        });

        Ok(deliveries.boxed())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to create channel: {0}")]
    CreationFailed(String),

    #[error("Failed to declare queue: {0}")]
    DeclareFailed(String),
}
