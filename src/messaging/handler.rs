use async_trait::async_trait;
use std::future::Future;

use super::delivery::Delivery;

/// Invoked once per delivery, concurrently with other invocations.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Failed to decode message payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Message handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Failed(_) => "failed",
        }
    }
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        (self.f)(delivery).await
    }
}
