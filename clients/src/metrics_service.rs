use crate::metrics_defs::METRICS_UPLOADS;
use domain::client::UpstreamError;
use domain::metrics::MetricsRequest;
use domain::sync::SharedCredentials;
use serde::Serialize;
use std::time::Duration;

const POST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsBody<'a> {
    metrics_data: &'a [domain::metrics::MetricsData],
    target_data: &'a [domain::metrics::TargetData],
}

/// HTTP client for the upstream metrics service.
pub struct MetricsService {
    http: reqwest::Client,
    base_url: String,
    creds: SharedCredentials,
}

impl MetricsService {
    pub fn new(
        base_url: impl Into<String>,
        creds: SharedCredentials,
    ) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(POST_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;
        Ok(MetricsService {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            creds,
        })
    }

    /// Posts one environment's aggregated metrics upstream. Upload is
    /// at-least-once; upstream dedupes on timestamp and environment.
    pub async fn post_metrics(&self, env: &str, req: &MetricsRequest) -> Result<(), UpstreamError> {
        let response = self
            .http
            .post(format!("{}/metrics/{env}", self.base_url))
            .query(&[("cluster", self.creds.cluster_identifier())])
            .bearer_auth(self.creds.token.get())
            .header("Account-ID", self.creds.account_id.get())
            .json(&MetricsBody {
                metrics_data: &req.metrics_data,
                target_data: &req.target_data,
            })
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        let status = response.status();
        metrics::counter!(METRICS_UPLOADS.name, "status" => status.as_u16().to_string())
            .increment(1);

        if !status.is_success() {
            return Err(UpstreamError::Unreachable(format!(
                "metrics service returned {status}"
            )));
        }
        Ok(())
    }
}
