use crate::metrics_defs::{SSE_CONNECTS, SSE_DISCONNECTS};
use crate::worker::Hook;
use async_trait::async_trait;
use domain::message::SseMessage;
use domain::stream::{MessageHandler, Stream, StreamError};
use domain::sync::SharedCredentials;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Consumes the upstream SSE stream and hands decoded change events to the
/// message handler. Connection state transitions fire the on-connect and
/// on-disconnect hooks.
///
/// This transport is consume-only; publishing returns an error.
pub struct SseClient {
    http: reqwest::Client,
    url: String,
    creds: SharedCredentials,
    on_connect: Option<Arc<dyn Hook>>,
    on_disconnect: Option<Arc<dyn Hook>>,
}

impl SseClient {
    pub fn new(url: impl Into<String>, creds: SharedCredentials) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StreamError::Subscribe(e.to_string()))?;

        Ok(SseClient {
            http,
            url: url.into(),
            creds,
            on_connect: None,
            on_disconnect: None,
        })
    }

    pub fn with_on_connect(mut self, hook: Arc<dyn Hook>) -> Self {
        self.on_connect = Some(hook);
        self
    }

    pub fn with_on_disconnect(mut self, hook: Arc<dyn Hook>) -> Self {
        self.on_disconnect = Some(hook);
        self
    }

    async fn disconnected(&self) {
        metrics::counter!(SSE_DISCONNECTS.name).increment(1);
        if let Some(hook) = &self.on_disconnect {
            hook.call().await;
        }
    }
}

#[async_trait]
impl Stream for SseClient {
    async fn publish(&self, _topic: &str, _msg: &SseMessage) -> Result<(), StreamError> {
        Err(StreamError::Publish(
            "the upstream SSE transport is consume only".to_string(),
        ))
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _from_id: Option<String>,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), StreamError> {
        let response = self
            .http
            .get(&self.url)
            .header("Authorization", format!("Bearer {}", self.creds.token.get()))
            .header("API-Key", self.creds.key.as_str())
            .header("Account-ID", self.creds.account_id.get())
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| StreamError::Subscribe(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            self.disconnected().await;
            return Err(StreamError::Subscribe(format!(
                "upstream returned {status}"
            )));
        }

        tracing::info!(url = %self.url, "connected to upstream SSE stream");
        metrics::counter!(SSE_CONNECTS.name).increment(1);
        if let Some(hook) = &self.on_connect {
            hook.call().await;
        }

        let mut events = response.bytes_stream().eventsource();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    let msg: SseMessage = match serde_json::from_str(&event.data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::warn!(error = %e, event = %event.event, "failed decoding SSE event");
                            continue;
                        }
                    };
                    if let Err(e) = handler.handle_message(&msg).await {
                        tracing::error!(error = %e, domain = %msg.domain, event = %msg.event, "failed handling SSE event");
                    }
                }
                Some(Err(e)) => {
                    self.disconnected().await;
                    return Err(StreamError::Subscribe(e.to_string()));
                }
                None => {
                    // Upstream closed the stream cleanly
                    self.disconnected().await;
                    return Err(StreamError::EndOfStream);
                }
            }
        }
    }
}
