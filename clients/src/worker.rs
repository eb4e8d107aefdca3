use crate::metrics_service::MetricsService;
use crate::queue::MetricsQueue;
use domain::metrics::{MetricStore, MetricsRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stream::RedisStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONSUMER_GROUP: &str = "metrics-workers";
const SUBSCRIBE_BACKOFF: Duration = Duration::from_secs(60);

/// Primary-side worker for the metrics pipeline.
///
/// N consumers drain the replica metrics stream into the Primary's
/// aggregation queue, and one flusher posts every flushed batch to the
/// upstream metrics service. Delivery is at-least-once; upstream dedupes on
/// timestamp and environment.
pub struct MetricsWorker {
    queue: Arc<MetricsQueue>,
    service: Arc<MetricsService>,
    stream: Arc<RedisStream>,
    topic: String,
    concurrency: usize,
}

impl MetricsWorker {
    pub fn new(
        queue: Arc<MetricsQueue>,
        service: Arc<MetricsService>,
        stream: Arc<RedisStream>,
        topic: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        MetricsWorker {
            queue,
            service,
            stream,
            topic: topic.into(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn start(
        &self,
        flushes: mpsc::Receiver<HashMap<String, MetricsRequest>>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.concurrency + 1);

        for i in 0..self.concurrency {
            handles.push(tokio::spawn(consume_stream(
                self.queue.clone(),
                self.stream.clone(),
                self.topic.clone(),
                format!("worker-{i}"),
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(forward_flushes(
            self.service.clone(),
            flushes,
        )));

        handles
    }
}

/// Reads replica metrics off the shared stream through a consumer group and
/// folds them into the aggregation queue.
async fn consume_stream(
    queue: Arc<MetricsQueue>,
    stream: Arc<RedisStream>,
    topic: String,
    consumer: String,
    cancel: CancellationToken,
) {
    loop {
        let result = stream
            .subscribe_group(&topic, CONSUMER_GROUP, &consumer, cancel.clone(), {
                let queue = queue.clone();
                move |_id, payload| {
                    let queue = queue.clone();
                    Box::pin(async move {
                        let req: MetricsRequest = serde_json::from_slice(&payload)?;
                        queue.store_metrics(req).await
                    })
                }
            })
            .await;

        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = result {
            tracing::error!(topic, consumer, error = %e, "metrics stream consumer dropped");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(SUBSCRIBE_BACKOFF) => {}
        }
    }
}

/// Posts every flushed batch upstream. Exits when the queue closes its
/// channel after cancellation.
pub async fn forward_flushes(
    service: Arc<MetricsService>,
    mut flushes: mpsc::Receiver<HashMap<String, MetricsRequest>>,
) {
    while let Some(batch) = flushes.recv().await {
        for (env, request) in batch {
            if request.metrics_data.is_empty() && request.target_data.is_empty() {
                continue;
            }
            if let Err(e) = service.post_metrics(&env, &request).await {
                tracing::error!(environment = %env, error = %e, "failed posting metrics upstream");
            }
        }
    }
}
