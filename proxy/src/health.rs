use cache::MemoizeCache;
use domain::requests::HealthResponse;
use domain::status::ConfigState;
use domain::sync::GuardedValue;
use std::sync::Arc;
use std::time::Duration;
use stream::StreamHealth;
use tokio_util::sync::CancellationToken;

/// Composite liveness view: startup config sync state, upstream stream
/// state and cache reachability.
pub struct ProxyHealth {
    config_status: GuardedValue<ConfigState>,
    stream_health: Arc<dyn StreamHealth>,
    cache: MemoizeCache,
}

impl ProxyHealth {
    pub fn new(
        config_status: ConfigState,
        stream_health: Arc<dyn StreamHealth>,
        cache: MemoizeCache,
    ) -> Self {
        ProxyHealth {
            config_status: GuardedValue::new(config_status),
            stream_health,
            cache,
        }
    }

    pub fn set_config_status(&self, status: ConfigState) {
        self.config_status.set(status);
    }

    pub async fn check(&self) -> HealthResponse {
        let mut response = HealthResponse::new();
        response.insert("config".to_string(), self.config_status.get().to_string());

        let stream = match self.stream_health.status().await {
            Ok(status) => status.state.to_string(),
            Err(e) => {
                tracing::error!(error = %e, "failed to check stream health");
                "UNKNOWN".to_string()
            }
        };
        response.insert("stream".to_string(), stream);

        let cache = match self.cache.health_check().await {
            Ok(()) => "healthy".to_string(),
            Err(e) => {
                tracing::error!(error = %e, "cache health check failed");
                "unhealthy".to_string()
            }
        };
        response.insert("cache".to_string(), cache);

        response
    }
}

/// Periodically pings the relay's own health endpoint, logging failures so a
/// wedged process shows up in the logs even when nothing scrapes it.
pub async fn heartbeat(url: String, interval: Duration, cancel: CancellationToken) {
    if interval.is_zero() {
        return;
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .danger_accept_invalid_certs(true)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "failed to build heartbeat client");
            return;
        }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = %url, "heartbeat ok");
            }
            Ok(response) => {
                tracing::error!(url = %url, status = %response.status(), "heartbeat returned non-success");
            }
            Err(e) => {
                tracing::error!(url = %url, error = %e, "heartbeat request failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cache::{CacheError, MemoryCache, NoOpMemoizeMetrics};
    use domain::status::{StreamState, StreamStatus};

    struct FixedHealth(StreamState);

    #[async_trait]
    impl StreamHealth for FixedHealth {
        async fn set_healthy(&self) -> Result<(), CacheError> {
            Ok(())
        }

        async fn set_unhealthy(&self) -> Result<(), CacheError> {
            Ok(())
        }

        async fn status(&self) -> Result<StreamStatus, CacheError> {
            Ok(StreamStatus::now(self.0))
        }
    }

    #[tokio::test]
    async fn check_reports_all_components() {
        let cache = MemoizeCache::new(
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
            Arc::new(NoOpMemoizeMetrics),
        );
        let health = ProxyHealth::new(
            ConfigState::Synced,
            Arc::new(FixedHealth(StreamState::Connected)),
            cache,
        );

        let response = health.check().await;
        assert_eq!(response["config"], "SYNCED");
        assert_eq!(response["stream"], "CONNECTED");
        assert_eq!(response["cache"], "healthy");

        health.set_config_status(ConfigState::FailedToSync);
        assert_eq!(health.check().await["config"], "FAILED_TO_SYNC");
    }
}
