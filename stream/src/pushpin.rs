use crate::ChannelCloser;
use async_trait::async_trait;
use domain::message::SseMessage;
use domain::stream::{MessageHandler, Stream, StreamError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Control-plane client for the Grip push gateway that owns the long-lived
/// SDK connections. The relay only publishes to channels and closes them;
/// the gateway performs the HTTP/SSE hold.
#[derive(Clone)]
pub struct Pushpin {
    http: reqwest::Client,
    publish_url: String,
}

impl Pushpin {
    pub fn new(control_uri: impl Into<String>) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()
            .map_err(|e| StreamError::Publish(e.to_string()))?;

        let control_uri = control_uri.into();
        Ok(Pushpin {
            http,
            publish_url: format!("{}/publish/", control_uri.trim_end_matches('/')),
        })
    }

    async fn post_items(&self, items: serde_json::Value) -> Result<(), StreamError> {
        let response = self
            .http
            .post(&self.publish_url)
            .json(&json!({ "items": items }))
            .send()
            .await
            .map_err(|e| StreamError::Publish(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StreamError::Publish(format!(
                "push gateway returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Stream for Pushpin {
    /// Publishes the event onto an SDK channel as an SSE frame.
    async fn publish(&self, topic: &str, msg: &SseMessage) -> Result<(), StreamError> {
        let data =
            serde_json::to_string(msg).map_err(|e| StreamError::Publish(e.to_string()))?;
        let content = format!("event: {}\ndata: {}\n\n", msg.event, data);

        self.post_items(json!([{
            "channel": topic,
            "formats": { "http-stream": { "content": content } },
        }]))
        .await
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _from_id: Option<String>,
        _handler: Arc<dyn MessageHandler>,
        _cancel: CancellationToken,
    ) -> Result<(), StreamError> {
        Err(StreamError::Subscribe(
            "the push gateway transport is publish only".to_string(),
        ))
    }

    async fn close(&self, channel: &str) -> Result<(), StreamError> {
        self.close_channel(channel).await
    }
}

#[async_trait]
impl ChannelCloser for Pushpin {
    /// Instructs the gateway to drop the long-lived connections held on a
    /// channel, forcing SDKs to fall back to polling.
    async fn close_channel(&self, channel: &str) -> Result<(), StreamError> {
        self.post_items(json!([{
            "channel": channel,
            "formats": { "http-stream": { "action": "close" } },
        }]))
        .await
    }
}
