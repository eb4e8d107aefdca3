use crate::ChannelCloser;
use crate::health::StreamHealth;
use crate::worker::Hook;
use async_trait::async_trait;
use domain::message::{SseMessage, msg_event};
use domain::status::StreamState;
use domain::stream::{DynError, MessageHandler, Stream};
use domain::sync::ConnectedStreams;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Per-step deadline for the connect/disconnect cascades so one hung call
/// cannot starve the others.
const STEP_DEADLINE: Duration = Duration::from_secs(15);

/// Triggers a full config refresh. Injected as a closure to break the cycle
/// between the stream fabric and the config loader.
pub type ReloadFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), DynError>> + Send + Sync>;

/// Fired when the Primary connects to the upstream SSE stream.
///
/// If the previous state was DISCONNECTED a full refresh runs first to catch
/// changes missed while the stream was down, then health flips to CONNECTED
/// and a control event tells replicas about the transition.
pub struct SaasOnConnect {
    health: Arc<dyn StreamHealth>,
    reload: ReloadFn,
    control: Arc<dyn Stream>,
    control_topic: String,
}

impl SaasOnConnect {
    pub fn new(
        health: Arc<dyn StreamHealth>,
        reload: ReloadFn,
        control: Arc<dyn Stream>,
        control_topic: impl Into<String>,
    ) -> Self {
        SaasOnConnect {
            health,
            reload,
            control,
            control_topic: control_topic.into(),
        }
    }
}

#[async_trait]
impl Hook for SaasOnConnect {
    async fn call(&self) {
        tracing::info!("connected to upstream SSE stream");

        let previous = match timeout(STEP_DEADLINE, self.health.status()).await {
            Ok(Ok(status)) => Some(status.state),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "on-connect failed to get stream status");
                None
            }
            Err(_) => {
                tracing::error!("on-connect timed out getting stream status");
                None
            }
        };

        if previous == Some(StreamState::Disconnected) {
            tracing::info!("polling for config changes missed while disconnected");
            match timeout(STEP_DEADLINE, (self.reload)()).await {
                Ok(Ok(())) => tracing::info!("successfully polled for config changes"),
                Ok(Err(e)) => tracing::error!(error = %e, "on-connect failed to poll for changes"),
                Err(_) => tracing::error!("on-connect config poll timed out"),
            }
        }

        match timeout(STEP_DEADLINE, self.health.set_healthy()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "failed to update stream status in cache"),
            Err(_) => tracing::error!("on-connect timed out updating stream status"),
        }

        let event = SseMessage::stream_action(StreamState::Connected);
        match timeout(STEP_DEADLINE, self.control.publish(&self.control_topic, &event)).await {
            Ok(Ok(())) => tracing::info!("published stream connected message for replicas"),
            Ok(Err(e)) => tracing::error!(error = %e, "failed to publish stream connected message"),
            Err(_) => tracing::error!("timed out publishing stream connected message"),
        }
    }
}

/// Fired when the Primary loses the upstream SSE stream.
///
/// Health flips to DISCONNECTED first so edge /stream requests are rejected,
/// then a full refresh catches up missed changes, every open Proxy -> SDK
/// stream is force-closed so SDKs fall back to polling, and a control event
/// tells replicas about the disconnect.
pub struct SaasOnDisconnect {
    health: Arc<dyn StreamHealth>,
    closer: Arc<dyn ChannelCloser>,
    control: Arc<dyn Stream>,
    control_topic: String,
    connected_streams: ConnectedStreams,
    reload: ReloadFn,
}

impl SaasOnDisconnect {
    pub fn new(
        health: Arc<dyn StreamHealth>,
        closer: Arc<dyn ChannelCloser>,
        control: Arc<dyn Stream>,
        control_topic: impl Into<String>,
        connected_streams: ConnectedStreams,
        reload: ReloadFn,
    ) -> Self {
        SaasOnDisconnect {
            health,
            closer,
            control,
            control_topic: control_topic.into(),
            connected_streams,
            reload,
        }
    }
}

#[async_trait]
impl Hook for SaasOnDisconnect {
    async fn call(&self) {
        tracing::info!("disconnected from upstream SSE stream");

        // Reject edge /stream requests until we've reconnected
        match timeout(STEP_DEADLINE, self.health.set_unhealthy()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "failed to set unhealthy stream status"),
            Err(_) => tracing::error!("timed out setting unhealthy stream status"),
        }

        tracing::info!("polling upstream for changes");
        match timeout(STEP_DEADLINE, (self.reload)()).await {
            Ok(Ok(())) => tracing::info!("successfully polled upstream for changes"),
            Ok(Err(e)) => tracing::error!(error = %e, "failed to poll for new config after disconnect"),
            Err(_) => tracing::error!("config poll timed out after disconnect"),
        }

        // Force SDKs onto polling so they can't miss changes pulled down
        // while the upstream stream is gone
        for channel in self.connected_streams.snapshot() {
            match timeout(STEP_DEADLINE, self.closer.close_channel(&channel)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(channel, error = %e, "failed to close Proxy->SDK stream")
                }
                Err(_) => tracing::error!(channel, "timed out closing Proxy->SDK stream"),
            }
        }

        let event = SseMessage::stream_action(StreamState::Disconnected);
        match timeout(STEP_DEADLINE, self.control.publish(&self.control_topic, &event)).await {
            Ok(Ok(())) => tracing::info!("published disconnected message for replicas"),
            Ok(Err(e)) => tracing::error!(error = %e, "failed to publish stream disconnected message"),
            Err(_) => tracing::error!("timed out publishing stream disconnected message"),
        }
    }
}

/// Fired when a replica loses one of its internal bus subscriptions.
pub struct ReplicaStreamDisconnect {
    topic: String,
}

impl ReplicaStreamDisconnect {
    pub fn new(topic: impl Into<String>) -> Self {
        ReplicaStreamDisconnect {
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl Hook for ReplicaStreamDisconnect {
    async fn call(&self) {
        tracing::error!(stream_name = %self.topic, "read replica disconnected from stream");
    }
}

/// Replica-side handler for control events from the Primary. Mirrors stream
/// health in memory and force-closes local SDK streams on a disconnect.
pub struct ControlMessageHandler {
    health: Arc<dyn StreamHealth>,
    closer: Arc<dyn ChannelCloser>,
    connected_streams: ConnectedStreams,
}

impl ControlMessageHandler {
    pub fn new(
        health: Arc<dyn StreamHealth>,
        closer: Arc<dyn ChannelCloser>,
        connected_streams: ConnectedStreams,
    ) -> Self {
        ControlMessageHandler {
            health,
            closer,
            connected_streams,
        }
    }
}

#[async_trait]
impl MessageHandler for ControlMessageHandler {
    async fn handle_message(&self, msg: &SseMessage) -> Result<(), DynError> {
        if msg.event != msg_event::STREAM_ACTION {
            return Ok(());
        }

        match msg.domain.as_str() {
            "CONNECTED" => {
                tracing::info!("primary reconnected to upstream");
                self.health.set_healthy().await?;
            }
            "DISCONNECTED" => {
                tracing::info!("primary disconnected from upstream, closing SDK streams");
                self.health.set_unhealthy().await?;
                for channel in self.connected_streams.snapshot() {
                    if let Err(e) = self.closer.close_channel(&channel).await {
                        tracing::error!(channel, error = %e, "failed to close Proxy->SDK stream");
                    }
                }
            }
            other => {
                tracing::warn!(state = other, "ignoring stream_action with unknown state");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::CacheError;
    use domain::status::StreamStatus;
    use domain::stream::{MessageHandler, StreamError};
    use parking_lot::Mutex;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct MockHealth {
        state: RwLock<StreamStatus>,
        transitions: Mutex<Vec<StreamState>>,
    }

    #[async_trait]
    impl StreamHealth for MockHealth {
        async fn set_healthy(&self) -> Result<(), CacheError> {
            *self.state.write() = StreamStatus::now(StreamState::Connected);
            self.transitions.lock().push(StreamState::Connected);
            Ok(())
        }

        async fn set_unhealthy(&self) -> Result<(), CacheError> {
            *self.state.write() = StreamStatus::now(StreamState::Disconnected);
            self.transitions.lock().push(StreamState::Disconnected);
            Ok(())
        }

        async fn status(&self) -> Result<StreamStatus, CacheError> {
            Ok(*self.state.read())
        }
    }

    #[derive(Default)]
    struct MockCloser {
        closed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelCloser for MockCloser {
        async fn close_channel(&self, channel: &str) -> Result<(), StreamError> {
            self.closed.lock().push(channel.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockControlStream {
        published: Mutex<Vec<(String, SseMessage)>>,
    }

    #[async_trait]
    impl Stream for MockControlStream {
        async fn publish(&self, topic: &str, msg: &SseMessage) -> Result<(), StreamError> {
            self.published.lock().push((topic.to_string(), msg.clone()));
            Ok(())
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _from_id: Option<String>,
            _handler: Arc<dyn MessageHandler>,
            _cancel: CancellationToken,
        ) -> Result<(), StreamError> {
            unimplemented!()
        }
    }

    fn counting_reload(counter: Arc<AtomicUsize>) -> ReloadFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn disconnect_cascade_runs_every_step() {
        let health = Arc::new(MockHealth::default());
        let closer = Arc::new(MockCloser::default());
        let control = Arc::new(MockControlStream::default());
        let reloads = Arc::new(AtomicUsize::new(0));
        let connected = ConnectedStreams::new();
        connected.register("env-1");

        let handler = SaasOnDisconnect::new(
            health.clone(),
            closer.clone(),
            control.clone(),
            "control",
            connected,
            counting_reload(reloads.clone()),
        );
        handler.call().await;

        // health flipped before any SDK stream was closed
        assert_eq!(
            *health.transitions.lock(),
            vec![StreamState::Disconnected]
        );
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(*closer.closed.lock(), vec!["env-1".to_string()]);

        let published = control.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "control");
        assert_eq!(published[0].1.event, msg_event::STREAM_ACTION);
        assert_eq!(published[0].1.domain, "DISCONNECTED");
    }

    #[tokio::test]
    async fn connect_after_disconnect_reloads_config() {
        let health = Arc::new(MockHealth::default());
        *health.state.write() = StreamStatus::now(StreamState::Disconnected);
        let control = Arc::new(MockControlStream::default());
        let reloads = Arc::new(AtomicUsize::new(0));

        let handler = SaasOnConnect::new(
            health.clone(),
            counting_reload(reloads.clone()),
            control.clone(),
            "control",
        );
        handler.call().await;

        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(
            health.status().await.unwrap().state,
            StreamState::Connected
        );
        assert_eq!(control.published.lock()[0].1.domain, "CONNECTED");
    }

    #[tokio::test]
    async fn first_connect_skips_reload() {
        let health = Arc::new(MockHealth::default());
        let control = Arc::new(MockControlStream::default());
        let reloads = Arc::new(AtomicUsize::new(0));

        let handler = SaasOnConnect::new(
            health.clone(),
            counting_reload(reloads.clone()),
            control,
            "control",
        );
        handler.call().await;

        assert_eq!(reloads.load(Ordering::SeqCst), 0);
        assert_eq!(
            health.status().await.unwrap().state,
            StreamState::Connected
        );
    }

    #[tokio::test]
    async fn control_handler_closes_streams_on_disconnect() {
        let health = Arc::new(MockHealth::default());
        let closer = Arc::new(MockCloser::default());
        let connected = ConnectedStreams::new();
        connected.register("env-1");
        connected.register("env-2");

        let handler = ControlMessageHandler::new(health.clone(), closer.clone(), connected);

        handler
            .handle_message(&SseMessage::stream_action(StreamState::Disconnected))
            .await
            .unwrap();
        assert_eq!(
            health.status().await.unwrap().state,
            StreamState::Disconnected
        );
        let mut closed = closer.closed.lock().clone();
        closed.sort();
        assert_eq!(closed, vec!["env-1".to_string(), "env-2".to_string()]);

        handler
            .handle_message(&SseMessage::stream_action(StreamState::Connected))
            .await
            .unwrap();
        assert_eq!(
            health.status().await.unwrap().state,
            StreamState::Connected
        );
    }

    #[tokio::test]
    async fn control_handler_ignores_data_events() {
        let health = Arc::new(MockHealth::default());
        let closer = Arc::new(MockCloser::default());
        let handler =
            ControlMessageHandler::new(health.clone(), closer.clone(), ConnectedStreams::new());

        handler
            .handle_message(&SseMessage {
                event: "patch".to_string(),
                domain: "flag".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(health.transitions.lock().is_empty());
        assert!(closer.closed.lock().is_empty());
    }
}
