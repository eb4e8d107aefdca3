use crate::metrics_defs::{FORWARD_FAILURES, FORWARDED_EVENTS};
use async_trait::async_trait;
use domain::message::{SseMessage, msg_domain};
use domain::stream::{DynError, MessageHandler, Stream, StreamError};
use std::sync::Arc;

/// A `MessageHandler` that republishes flag and target-segment events on an
/// output transport and then hands the message to a delegate handler.
///
/// The two paths are independent: a publish failure never skips the
/// delegate and a delegate failure never skips the publish. Errors from
/// either path are returned, the delegate's taking precedence.
pub struct Forwarder {
    stream: Arc<dyn Stream>,
    next: Arc<dyn MessageHandler>,
    topic: Option<String>,
}

impl Forwarder {
    /// Creates a forwarder that publishes each event to the channel of every
    /// environment the event names.
    pub fn new(stream: Arc<dyn Stream>, next: Arc<dyn MessageHandler>) -> Self {
        Forwarder {
            stream,
            next,
            topic: None,
        }
    }

    /// Publishes every event to one fixed topic instead of per-environment
    /// channels.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    async fn publish(&self, msg: &SseMessage) -> Result<(), StreamError> {
        match &self.topic {
            Some(topic) => self.stream.publish(topic, msg).await,
            None => {
                for env in &msg.environments {
                    self.stream.publish(env, msg).await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Forwarder {
    async fn handle_message(&self, msg: &SseMessage) -> Result<(), DynError> {
        let forwardable = matches!(
            msg.domain.as_str(),
            msg_domain::FLAG | msg_domain::TARGET_SEGMENT
        );

        let mut publish_err: Option<StreamError> = None;
        if forwardable {
            match self.publish(msg).await {
                Ok(()) => metrics::counter!(FORWARDED_EVENTS.name).increment(1),
                Err(e) => {
                    metrics::counter!(FORWARD_FAILURES.name).increment(1);
                    tracing::error!(
                        error = %e,
                        domain = %msg.domain,
                        event = %msg.event,
                        "failed forwarding event, continuing to delegate"
                    );
                    publish_err = Some(e);
                }
            }
        }

        let delegate_result = self.next.handle_message(msg).await;

        match (publish_err, delegate_result) {
            (_, Err(e)) => Err(e),
            (Some(e), Ok(())) => Err(Box::new(e)),
            (None, Ok(())) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::stream::NoOpMessageHandler;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct MockPublisher {
        fail: bool,
        published: AtomicUsize,
        topics: Mutex<Vec<String>>,
    }

    impl MockPublisher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(MockPublisher {
                fail,
                published: AtomicUsize::new(0),
                topics: Mutex::new(Vec::new()),
            })
        }

        fn published(&self) -> usize {
            self.published.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Stream for MockPublisher {
        async fn publish(&self, topic: &str, _msg: &SseMessage) -> Result<(), StreamError> {
            if self.fail {
                return Err(StreamError::Publish("an error".to_string()));
            }
            self.published.fetch_add(1, Ordering::Relaxed);
            self.topics.lock().push(topic.to_string());
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

    struct MockHandler {
        fail: bool,
        calls: AtomicUsize,
    }

    impl MockHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(MockHandler {
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for MockHandler {
        async fn handle_message(&self, _msg: &SseMessage) -> Result<(), DynError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err("an error".into());
            }
            Ok(())
        }
    }

    fn flag_message() -> SseMessage {
        SseMessage {
            domain: msg_domain::FLAG.to_string(),
            environments: vec!["env-1".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn forwards_flag_and_segment_domains_only() {
        for (domain, expected) in [
            (msg_domain::FLAG, 1),
            (msg_domain::TARGET_SEGMENT, 1),
            ("", 0),
            ("foo", 0),
        ] {
            let publisher = MockPublisher::new(false);
            let forwarder = Forwarder::new(publisher.clone(), Arc::new(NoOpMessageHandler));

            let msg = SseMessage {
                domain: domain.to_string(),
                environments: vec!["env-1".to_string()],
                ..Default::default()
            };
            forwarder.handle_message(&msg).await.unwrap();
            assert_eq!(publisher.published(), expected, "domain {domain:?}");
        }
    }

    #[tokio::test]
    async fn publishes_to_every_environment_channel() {
        let publisher = MockPublisher::new(false);
        let forwarder = Forwarder::new(publisher.clone(), Arc::new(NoOpMessageHandler));

        let msg = SseMessage {
            domain: msg_domain::FLAG.to_string(),
            environments: vec!["env-1".to_string(), "env-2".to_string()],
            ..Default::default()
        };
        forwarder.handle_message(&msg).await.unwrap();
        assert_eq!(
            *publisher.topics.lock(),
            vec!["env-1".to_string(), "env-2".to_string()]
        );
    }

    #[tokio::test]
    async fn fixed_topic_overrides_environment_channels() {
        let publisher = MockPublisher::new(false);
        let forwarder = Forwarder::new(publisher.clone(), Arc::new(NoOpMessageHandler))
            .with_topic("proxy:sse_events");

        forwarder.handle_message(&flag_message()).await.unwrap();
        assert_eq!(*publisher.topics.lock(), vec!["proxy:sse_events".to_string()]);
    }

    #[tokio::test]
    async fn publish_failure_still_invokes_delegate() {
        let publisher = MockPublisher::new(true);
        let handler = MockHandler::new(false);
        let forwarder = Forwarder::new(publisher.clone(), handler.clone());

        let err = forwarder.handle_message(&flag_message()).await.unwrap_err();
        assert!(err.to_string().contains("an error"));
        assert_eq!(handler.calls.load(Ordering::Relaxed), 1);
        assert_eq!(publisher.published(), 0);
    }

    #[tokio::test]
    async fn delegate_failure_still_publishes() {
        let publisher = MockPublisher::new(false);
        let handler = MockHandler::new(true);
        let forwarder = Forwarder::new(publisher.clone(), handler.clone());

        let err = forwarder.handle_message(&flag_message()).await.unwrap_err();
        assert!(err.to_string().contains("an error"));
        assert_eq!(publisher.published(), 1);
        assert_eq!(handler.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn chained_forwarders_publish_independently() {
        // pushpin forwarder wraps the internal bus forwarder; a failure on
        // one output never blocks the other
        let pushpin = MockPublisher::new(false);
        let bus = MockPublisher::new(true);

        let bus_forwarder =
            Arc::new(Forwarder::new(bus.clone(), Arc::new(NoOpMessageHandler)).with_topic("bus"));
        let pushpin_forwarder = Forwarder::new(pushpin.clone(), bus_forwarder);

        let err = pushpin_forwarder
            .handle_message(&flag_message())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("an error"));
        assert_eq!(pushpin.published(), 1);
        assert_eq!(bus.published(), 0);
    }
}
