use crate::metrics_defs::{QUEUE_DROPPED, QUEUE_FLUSHES};
use async_trait::async_trait;
use domain::metrics::{MetricStore, MetricsRequest};
use domain::stream::DynError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Cumulative size caps for the two sub-buffers, in request-body bytes.
pub const MAX_EVAL_QUEUE_SIZE: usize = 1_000_000;
pub const MAX_TARGET_QUEUE_SIZE: usize = 500_000;

const FLUSH_CHANNEL_DEPTH: usize = 16;

/// One size-capped aggregation buffer: metrics keyed by environment plus the
/// cumulative size of everything stored since the last flush.
struct SubBuffer {
    label: &'static str,
    requests: HashMap<String, MetricsRequest>,
    current_size: usize,
    max_size: usize,
}

impl SubBuffer {
    fn new(label: &'static str, max_size: usize) -> Self {
        SubBuffer {
            label,
            requests: HashMap::new(),
            current_size: 0,
            max_size,
        }
    }

    /// Stores one entry, folding it into the environment's pending request.
    /// When the buffer is already over its cap the new entry is dropped and
    /// the size resets so what is currently held goes out on the next flush.
    fn store(&mut self, part: MetricsRequest) -> bool {
        if self.current_size > self.max_size {
            self.current_size = 0;
            return false;
        }

        self.current_size += part.size;
        match self.requests.get_mut(&part.environment_id) {
            Some(existing) => existing.merge(part),
            None => {
                self.requests.insert(part.environment_id.clone(), part);
            }
        }
        true
    }

    fn flush(&mut self) -> Option<HashMap<String, MetricsRequest>> {
        self.current_size = 0;
        if self.requests.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.requests))
    }
}

/// Primary-side bounded metrics aggregator.
///
/// Evaluation data and target data accumulate in two independent sub-buffers
/// with their own size caps and flush tickers. Flushed batches land on the
/// channel returned from [`MetricsQueue::new`], which closes once the token
/// is cancelled and the final flush has gone out.
pub struct MetricsQueue {
    eval: Mutex<SubBuffer>,
    targets: Mutex<SubBuffer>,
    tx: mpsc::Sender<HashMap<String, MetricsRequest>>,
}

impl MetricsQueue {
    pub fn new(
        cancel: CancellationToken,
        metrics_interval: Duration,
        targets_interval: Duration,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<HashMap<String, MetricsRequest>>,
    ) {
        let (tx, rx) = mpsc::channel(FLUSH_CHANNEL_DEPTH);
        let queue = Arc::new(MetricsQueue {
            eval: Mutex::new(SubBuffer::new("evaluations", MAX_EVAL_QUEUE_SIZE)),
            targets: Mutex::new(SubBuffer::new("targets", MAX_TARGET_QUEUE_SIZE)),
            tx,
        });

        tokio::spawn({
            let queue = queue.clone();
            async move { queue.run_flush_loop(cancel, metrics_interval, targets_interval).await }
        });

        (queue, rx)
    }

    async fn run_flush_loop(
        &self,
        cancel: CancellationToken,
        metrics_interval: Duration,
        targets_interval: Duration,
    ) {
        let mut metrics_ticker = tokio::time::interval(metrics_interval);
        let mut targets_ticker = tokio::time::interval(targets_interval);
        metrics_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        targets_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        metrics_ticker.tick().await;
        targets_ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Final flush so nothing already aggregated is lost
                    self.flush(&self.eval).await;
                    self.flush(&self.targets).await;
                    return;
                }
                _ = metrics_ticker.tick() => self.flush(&self.eval).await,
                _ = targets_ticker.tick() => self.flush(&self.targets).await,
            }
        }
    }

    async fn flush(&self, buffer: &Mutex<SubBuffer>) {
        let (label, batch) = {
            let mut buffer = buffer.lock();
            (buffer.label, buffer.flush())
        };
        let Some(batch) = batch else { return };

        metrics::counter!(QUEUE_FLUSHES.name, "buffer" => label).increment(1);
        if self.tx.send(batch).await.is_err() {
            tracing::warn!(buffer = label, "metrics flush receiver dropped");
        }
    }
}

#[async_trait]
impl MetricStore for MetricsQueue {
    async fn store_metrics(&self, req: MetricsRequest) -> Result<(), DynError> {
        if let Some(eval) = req.evaluation_part()
            && !self.eval.lock().store(eval)
        {
            metrics::counter!(QUEUE_DROPPED.name, "buffer" => "evaluations").increment(1);
            tracing::warn!(
                environment = %req.environment_id,
                "evaluation buffer over capacity, dropping new metrics"
            );
        }

        if let Some(target) = req.target_part()
            && !self.targets.lock().store(target)
        {
            metrics::counter!(QUEUE_DROPPED.name, "buffer" => "targets").increment(1);
            tracing::warn!(
                environment = %req.environment_id,
                "target buffer over capacity, dropping new target data"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::metrics::{MetricsData, TargetData};

    fn request(env: &str, size: usize) -> MetricsRequest {
        MetricsRequest {
            environment_id: env.to_string(),
            size,
            metrics_data: vec![MetricsData {
                timestamp: 111,
                count: 1,
                metrics_type: "Server".to_string(),
                attributes: Vec::new(),
            }],
            target_data: vec![TargetData {
                identifier: "Foo".to_string(),
                name: "Bar".to_string(),
                attributes: Vec::new(),
            }],
        }
    }

    #[tokio::test]
    async fn splits_eval_and_target_data() {
        let cancel = CancellationToken::new();
        let (queue, _rx) = MetricsQueue::new(
            cancel.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );

        queue.store_metrics(request("123", 7)).await.unwrap();

        let eval = queue.eval.lock();
        assert_eq!(eval.requests["123"].metrics_data.len(), 1);
        assert!(eval.requests["123"].target_data.is_empty());
        assert_eq!(eval.current_size, 7);

        let targets = queue.targets.lock();
        assert_eq!(targets.requests["123"].target_data.len(), 1);
        assert!(targets.requests["123"].metrics_data.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn empty_parts_are_not_stored() {
        let cancel = CancellationToken::new();
        let (queue, _rx) = MetricsQueue::new(
            cancel.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );

        queue
            .store_metrics(MetricsRequest {
                environment_id: "123".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(queue.eval.lock().requests.is_empty());
        assert!(queue.targets.lock().requests.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn over_cap_drops_new_entry_and_flushes_held_data() {
        let cancel = CancellationToken::new();
        let (queue, mut rx) = MetricsQueue::new(
            cancel.clone(),
            Duration::from_millis(50),
            Duration::from_secs(3600),
        );

        // Pre-load the evaluation buffer beyond its cap
        {
            let mut eval = queue.eval.lock();
            let preloaded = request("123", 7).evaluation_part().unwrap();
            eval.store(preloaded);
            eval.current_size = MAX_EVAL_QUEUE_SIZE * 2;
        }

        queue.store_metrics(request("123", 7)).await.unwrap();

        // The new entry was not folded in
        assert_eq!(queue.eval.lock().requests["123"].metrics_data.len(), 1);
        // The target half was under its cap, so it was stored
        assert_eq!(queue.targets.lock().requests["123"].target_data.len(), 1);

        // The next tick emits only the pre-loaded evaluation data
        let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch["123"].metrics_data.len(), 1);
        assert!(batch["123"].target_data.is_empty());

        // Dropping the new entry reset the size, so storing works again
        queue.store_metrics(request("123", 7)).await.unwrap();
        assert_eq!(queue.eval.lock().current_size, 7);
        cancel.cancel();
    }

    #[tokio::test]
    async fn listen_yields_batches_until_cancelled() {
        let cancel = CancellationToken::new();
        let (queue, mut rx) = MetricsQueue::new(
            cancel.clone(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );

        queue.store_metrics(request("123", 7)).await.unwrap();
        queue
            .store_metrics(MetricsRequest {
                environment_id: "456".to_string(),
                size: 8,
                metrics_data: vec![MetricsData::default()],
                target_data: Vec::new(),
            })
            .await
            .unwrap();

        let mut seen = HashMap::new();
        while seen.len() < 2 {
            let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.extend(batch);
        }
        assert!(seen.contains_key("123"));
        assert!(seen.contains_key("456"));

        // Cancellation closes the channel after the final flush
        cancel.cancel();
        let mut closed = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }
        assert!(closed, "channel should close after cancellation");
    }
}
