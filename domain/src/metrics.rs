use crate::model::EnvironmentId;
use crate::stream::DynError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// One aggregated evaluation count as uploaded to the upstream metrics
/// service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsData {
    pub timestamp: i64,
    pub count: i64,
    pub metrics_type: String,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

/// A target identity observed during evaluations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetData {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

/// Metrics posted by an SDK. Evaluation data and target data are co-carried
/// but flushed independently by the aggregation queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRequest {
    #[serde(default)]
    pub environment_id: EnvironmentId,
    /// Size in bytes of the request body, used for queue cap accounting.
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub metrics_data: Vec<MetricsData>,
    #[serde(default)]
    pub target_data: Vec<TargetData>,
}

impl MetricsRequest {
    /// The evaluation-data half of this request, or None when there is none.
    pub fn evaluation_part(&self) -> Option<MetricsRequest> {
        if self.metrics_data.is_empty() {
            return None;
        }
        Some(MetricsRequest {
            environment_id: self.environment_id.clone(),
            size: self.size,
            metrics_data: self.metrics_data.clone(),
            target_data: Vec::new(),
        })
    }

    /// The target-data half of this request, or None when there is none.
    pub fn target_part(&self) -> Option<MetricsRequest> {
        if self.target_data.is_empty() {
            return None;
        }
        Some(MetricsRequest {
            environment_id: self.environment_id.clone(),
            size: self.size,
            metrics_data: Vec::new(),
            target_data: self.target_data.clone(),
        })
    }

    /// Folds another request for the same environment into this one.
    pub fn merge(&mut self, other: MetricsRequest) {
        self.metrics_data.extend(other.metrics_data);
        self.target_data.extend(other.target_data);
        self.size += other.size;
    }
}

/// Sink for metrics posted by SDKs. The Primary aggregates them in memory,
/// replicas write through to the shared stream.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn store_metrics(&self, req: MetricsRequest) -> Result<(), DynError>;
}
