use async_trait::async_trait;
use domain::message::SseMessage;
use domain::stream::{DynError, MessageHandler, Stream, StreamError};
use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How long one blocking read waits before the loop re-checks cancellation.
const READ_BLOCK_MILLIS: usize = 5_000;
const READ_COUNT: usize = 100;

/// Field name stream payloads are stored under.
const EVENT_FIELD: &str = "event";

/// `Stream` implementation over Redis streams. Publishes with XADD and
/// consumes with blocking XREAD on a dedicated connection per subscription.
#[derive(Clone)]
pub struct RedisStream {
    client: redis::Client,
    publisher: ConnectionManager,
    max_len: Option<u64>,
}

impl RedisStream {
    pub async fn connect(client: redis::Client) -> Result<Self, StreamError> {
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StreamError::Subscribe(e.to_string()))?;
        Ok(RedisStream {
            client,
            publisher,
            max_len: None,
        })
    }

    /// Caps the stream length with approximate trimming, discarding oldest
    /// entries when full.
    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Appends a raw payload to the stream, creating the stream if it does
    /// not exist yet.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), StreamError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(topic);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*").arg(EVENT_FIELD).arg(payload);

        let mut conn = self.publisher.clone();
        cmd.query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| StreamError::Publish(e.to_string()))
    }

    /// Reads the stream from `from_id` (or only new entries when None),
    /// invoking `on_event` for every entry in delivery order. Returns Ok on
    /// cancellation, Err on transport failure or when the handler signals
    /// end of stream.
    pub async fn subscribe_raw<F>(
        &self,
        topic: &str,
        from_id: Option<String>,
        cancel: CancellationToken,
        mut on_event: F,
    ) -> Result<(), StreamError>
    where
        F: FnMut(String, Vec<u8>) -> BoxFuture<'static, Result<(), DynError>> + Send,
    {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StreamError::Subscribe(e.to_string()))?;

        let mut last_id = from_id.unwrap_or_else(|| "$".to_string());
        let options = StreamReadOptions::default()
            .block(READ_BLOCK_MILLIS)
            .count(READ_COUNT);

        loop {
            let topics = [topic];
            let ids = [last_id.as_str()];
            let read =
                conn.xread_options::<_, _, Option<StreamReadReply>>(&topics, &ids, &options);

            let reply = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                reply = read => reply.map_err(|e| StreamError::Subscribe(e.to_string()))?,
            };

            let Some(reply) = reply else { continue };
            for key in reply.keys {
                for entry in key.ids {
                    last_id = entry.id.clone();
                    let Some(payload) = entry.map.get(EVENT_FIELD).and_then(value_bytes) else {
                        continue;
                    };
                    if let Err(e) = on_event(entry.id.clone(), payload).await {
                        // An end-of-stream signal from the handler means a
                        // disconnect, everything else is skippable
                        if is_end_of_stream(&e) {
                            return Err(StreamError::EndOfStream);
                        }
                        tracing::warn!(topic, id = %entry.id, error = %e, "failed handling stream entry");
                    }
                }
            }
        }
    }

    /// Like [`subscribe_raw`] but reads through a consumer group so multiple
    /// consumers share the stream, acknowledging entries after handling.
    ///
    /// [`subscribe_raw`]: RedisStream::subscribe_raw
    pub async fn subscribe_group<F>(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        cancel: CancellationToken,
        mut on_event: F,
    ) -> Result<(), StreamError>
    where
        F: FnMut(String, Vec<u8>) -> BoxFuture<'static, Result<(), DynError>> + Send,
    {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StreamError::Subscribe(e.to_string()))?;

        // Create the group at the stream tail; already-exists is fine
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await;
        if let Err(e) = created
            && e.code() != Some("BUSYGROUP")
        {
            return Err(StreamError::Subscribe(e.to_string()));
        }

        let options = StreamReadOptions::default()
            .block(READ_BLOCK_MILLIS)
            .count(READ_COUNT)
            .group(group, consumer);

        loop {
            let topics = [topic];
            let ids = [">"];
            let read =
                conn.xread_options::<_, _, Option<StreamReadReply>>(&topics, &ids, &options);

            let reply = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                reply = read => reply.map_err(|e| StreamError::Subscribe(e.to_string()))?,
            };

            let Some(reply) = reply else { continue };
            for key in reply.keys {
                for entry in key.ids {
                    if let Some(payload) = entry.map.get(EVENT_FIELD).and_then(value_bytes)
                        && let Err(e) = on_event(entry.id.clone(), payload).await
                    {
                        if is_end_of_stream(&e) {
                            return Err(StreamError::EndOfStream);
                        }
                        tracing::warn!(topic, id = %entry.id, error = %e, "failed handling stream entry");
                    }

                    if let Err(e) = redis::cmd("XACK")
                        .arg(topic)
                        .arg(group)
                        .arg(&entry.id)
                        .query_async::<()>(&mut conn)
                        .await
                    {
                        tracing::warn!(topic, id = %entry.id, error = %e, "failed to ack stream entry");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Stream for RedisStream {
    async fn publish(&self, topic: &str, msg: &SseMessage) -> Result<(), StreamError> {
        let payload =
            serde_json::to_vec(msg).map_err(|e| StreamError::Publish(e.to_string()))?;
        self.publish_raw(topic, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        from_id: Option<String>,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), StreamError> {
        self.subscribe_raw(topic, from_id, cancel, move |_id, payload| {
            let handler = handler.clone();
            Box::pin(async move {
                let msg: SseMessage = serde_json::from_slice(&payload)?;
                handler.handle_message(&msg).await
            })
        })
        .await
    }
}

fn value_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(data) => Some(data.clone()),
        Value::SimpleString(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

fn is_end_of_stream(e: &DynError) -> bool {
    matches!(e.downcast_ref::<StreamError>(), Some(StreamError::EndOfStream))
}
