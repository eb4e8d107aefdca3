use async_trait::async_trait;
use domain::stream::{MessageHandler, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

/// A side effect fired on stream connection state transitions.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self);
}

/// Wraps a transport subscription with reconnect-forever semantics: connect,
/// run the handler until the transport drops, fire the on-disconnect hook,
/// sleep the backoff, retry. Exits only on cancellation.
pub struct StreamWorker {
    topic: String,
    transport: Arc<dyn Stream>,
    handler: Arc<dyn MessageHandler>,
    backoff: Duration,
    on_disconnect: Option<Arc<dyn Hook>>,
}

impl StreamWorker {
    pub fn new(
        topic: impl Into<String>,
        transport: Arc<dyn Stream>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        StreamWorker {
            topic: topic.into(),
            transport,
            handler,
            backoff: DEFAULT_BACKOFF,
            on_disconnect: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_on_disconnect(mut self, hook: Arc<dyn Hook>) -> Self {
        self.on_disconnect = Some(hook);
        self
    }

    pub async fn subscribe(&self, cancel: CancellationToken) {
        loop {
            match self
                .transport
                .subscribe(&self.topic, None, self.handler.clone(), cancel.clone())
                .await
            {
                Ok(()) => {
                    // A clean return means the token was cancelled
                    if cancel.is_cancelled() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(topic = %self.topic, error = %e, "stream subscription dropped");
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            if let Some(hook) = &self.on_disconnect {
                hook.call().await;
            }

            tracing::info!(topic = %self.topic, backoff = ?self.backoff, "reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }

    /// Runs the subscribe loop on its own task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.subscribe(cancel).await })
    }
}
