use async_trait::async_trait;
use domain::metrics::{MetricStore, MetricsRequest};
use domain::stream::DynError;
use std::sync::Arc;
use stream::RedisStream;

/// Replica-side metric store that writes through to the capped internal
/// stream for the Primary's worker to drain. Replicas never talk to the
/// upstream metrics service themselves.
pub struct MetricsStreamStore {
    stream: Arc<RedisStream>,
    topic: String,
}

impl MetricsStreamStore {
    pub fn new(stream: Arc<RedisStream>, topic: impl Into<String>) -> Self {
        MetricsStreamStore {
            stream,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl MetricStore for MetricsStreamStore {
    async fn store_metrics(&self, req: MetricsRequest) -> Result<(), DynError> {
        let payload = serde_json::to_vec(&req)?;
        self.stream
            .publish_raw(&self.topic, payload)
            .await
            .map_err(|e| Box::new(e) as DynError)
    }
}
