use crate::message::SseMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Handles one decoded change event at a time. Within one subscription,
/// invocations are serialized in delivery order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, msg: &SseMessage) -> Result<(), DynError>;
}

pub struct NoOpMessageHandler;

#[async_trait]
impl MessageHandler for NoOpMessageHandler {
    async fn handle_message(&self, _msg: &SseMessage) -> Result<(), DynError> {
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("failed publishing to stream: {0}")]
    Publish(String),

    #[error("failed subscribing to stream: {0}")]
    Subscribe(String),

    /// The transport reported a clean end of stream. Callers treat this as a
    /// disconnect rather than a skippable error.
    #[error("end of stream")]
    EndOfStream,
}

/// A transport for change events: the shared stream store, the upstream SSE
/// source, or the push gateway.
#[async_trait]
pub trait Stream: Send + Sync {
    async fn publish(&self, topic: &str, msg: &SseMessage) -> Result<(), StreamError>;

    /// Blocks delivering messages to `handler` until the token is cancelled
    /// (Ok) or the transport fails (Err). Callers apply backoff and retry.
    async fn subscribe(
        &self,
        topic: &str,
        from_id: Option<String>,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), StreamError>;

    async fn close(&self, _channel: &str) -> Result<(), StreamError> {
        Ok(())
    }
}
