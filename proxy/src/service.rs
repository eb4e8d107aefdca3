use crate::health::ProxyHealth;
use crate::token::{Claims, TokenError, TokenSource};
use cache::CacheError;
use domain::metrics::{MetricStore, MetricsRequest, TargetData};
use domain::model::{AuthApiKey, FeatureConfig, Segment, Target};
use domain::requests::{AuthRequest, AuthResponse, HealthResponse, StreamResponse};
use domain::status::StreamState;
use domain::sync::ConnectedStreams;
use repository::{AuthRepo, FlagRepo, SegmentRepo, TargetRepo};
use std::sync::Arc;
use stream::StreamHealth;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("not authorized")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(&'static str),

    /// The upstream stream is not healthy, so /stream requests are rejected
    /// and SDKs fall back to polling.
    #[error("stream not available")]
    StreamUnavailable,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for ServiceError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::NotAuthorized => ServiceError::Unauthorized,
            TokenError::Cache(e) => ServiceError::Cache(e),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// The operations the edge layer binds to HTTP. Every read is served from
/// the cache; no operation performs upstream I/O on the request path.
pub struct ProxyService {
    flag_repo: FlagRepo,
    segment_repo: SegmentRepo,
    target_repo: TargetRepo,
    auth_repo: AuthRepo,
    token_source: TokenSource,
    metric_store: Arc<dyn MetricStore>,
    stream_health: Arc<dyn StreamHealth>,
    connected_streams: ConnectedStreams,
    health: Arc<ProxyHealth>,
    forward_targets: bool,
}

impl ProxyService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flag_repo: FlagRepo,
        segment_repo: SegmentRepo,
        target_repo: TargetRepo,
        auth_repo: AuthRepo,
        token_source: TokenSource,
        metric_store: Arc<dyn MetricStore>,
        stream_health: Arc<dyn StreamHealth>,
        connected_streams: ConnectedStreams,
        health: Arc<ProxyHealth>,
        forward_targets: bool,
    ) -> Self {
        ProxyService {
            flag_repo,
            segment_repo,
            target_repo,
            auth_repo,
            token_source,
            metric_store,
            stream_health,
            connected_streams,
            health,
            forward_targets,
        }
    }

    /// Exchanges an SDK API key for a signed bearer token, registering the
    /// request's target identity along the way.
    pub async fn authenticate(&self, req: AuthRequest) -> Result<AuthResponse, ServiceError> {
        let (token, claims) = self.token_source.generate_token(&req.api_key).await?;

        if let Some(target) = req.target {
            self.register_target(&claims, target).await;
        }

        Ok(AuthResponse { auth_token: token })
    }

    async fn register_target(&self, claims: &Claims, target: Target) {
        if let Err(e) = self.target_repo.add(&claims.env, vec![target.clone()]).await {
            tracing::error!(error = %e, environment = %claims.env, "failed storing auth target");
        }

        // Target identities reach upstream through the metrics pipeline's
        // target data stream
        if self.forward_targets {
            let request = MetricsRequest {
                environment_id: claims.env.clone(),
                size: target.identifier.len() + target.name.len(),
                metrics_data: Vec::new(),
                target_data: vec![TargetData {
                    identifier: target.identifier,
                    name: target.name,
                    attributes: target
                        .attributes
                        .iter()
                        .map(|(k, v)| domain::metrics::KeyValue {
                            key: k.clone(),
                            value: v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string()),
                        })
                        .collect(),
                }],
            };
            if let Err(e) = self.metric_store.store_metrics(request).await {
                tracing::error!(error = %e, "failed forwarding auth target upstream");
            }
        }
    }

    pub async fn feature_configs(&self, env: &str) -> Result<Vec<FeatureConfig>, ServiceError> {
        Ok(self.flag_repo.get(env).await?)
    }

    pub async fn feature_config_by_identifier(
        &self,
        env: &str,
        identifier: &str,
    ) -> Result<FeatureConfig, ServiceError> {
        self.flag_repo
            .get_by_identifier(env, identifier)
            .await?
            .ok_or(ServiceError::NotFound("feature config"))
    }

    pub async fn target_segments(&self, env: &str) -> Result<Vec<Segment>, ServiceError> {
        Ok(self.segment_repo.get(env).await?)
    }

    pub async fn target_segment_by_identifier(
        &self,
        env: &str,
        identifier: &str,
    ) -> Result<Segment, ServiceError> {
        self.segment_repo
            .get_by_identifier(env, identifier)
            .await?
            .ok_or(ServiceError::NotFound("target segment"))
    }

    /// Flag data for a target's evaluations. Rule evaluation itself is
    /// delegated to the consuming SDK.
    pub async fn evaluations(
        &self,
        env: &str,
        _target: &str,
    ) -> Result<Vec<FeatureConfig>, ServiceError> {
        Ok(self.flag_repo.get(env).await?)
    }

    pub async fn evaluations_by_feature(
        &self,
        env: &str,
        _target: &str,
        feature: &str,
    ) -> Result<FeatureConfig, ServiceError> {
        self.flag_repo
            .get_by_identifier(env, feature)
            .await?
            .ok_or(ServiceError::NotFound("feature config"))
    }

    /// Registers an SDK stream and returns the push gateway channel it will
    /// be held on. Rejected while the upstream stream is unhealthy so SDKs
    /// poll instead of listening to a channel that can miss changes.
    pub async fn stream(&self, api_key: &str) -> Result<StreamResponse, ServiceError> {
        let status = self
            .stream_health
            .status()
            .await
            .map_err(ServiceError::Cache)?;
        if status.state != StreamState::Connected {
            return Err(ServiceError::StreamUnavailable);
        }

        let env = self
            .auth_repo
            .get(&AuthApiKey::new(api_key))
            .await?
            .ok_or(ServiceError::Unauthorized)?;

        self.connected_streams.register(env.clone());
        Ok(StreamResponse { grip_channel: env })
    }

    /// Accepts SDK metrics for aggregation and periodic upload.
    pub async fn metrics(&self, env: &str, mut req: MetricsRequest) -> Result<(), ServiceError> {
        req.environment_id = env.to_string();
        if req.size == 0 {
            req.size = serde_json::to_vec(&req).map(|b| b.len()).unwrap_or(0);
        }
        self.metric_store
            .store_metrics(req)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    pub async fn health(&self) -> HealthResponse {
        self.health.check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cache::{MemoizeCache, MemoryCache, NoOpMemoizeMetrics};
    use domain::model::AuthConfig;
    use domain::status::{ConfigState, StreamStatus};
    use domain::stream::DynError;
    use parking_lot::Mutex;
    use parking_lot::RwLock;
    use std::time::Duration;

    #[derive(Default)]
    struct MockMetricStore {
        stored: Mutex<Vec<MetricsRequest>>,
    }

    #[async_trait]
    impl MetricStore for MockMetricStore {
        async fn store_metrics(&self, req: MetricsRequest) -> Result<(), DynError> {
            self.stored.lock().push(req);
            Ok(())
        }
    }

    struct MockStreamHealth {
        state: RwLock<StreamState>,
    }

    #[async_trait]
    impl StreamHealth for MockStreamHealth {
        async fn set_healthy(&self) -> Result<(), CacheError> {
            *self.state.write() = StreamState::Connected;
            Ok(())
        }

        async fn set_unhealthy(&self) -> Result<(), CacheError> {
            *self.state.write() = StreamState::Disconnected;
            Ok(())
        }

        async fn status(&self) -> Result<StreamStatus, CacheError> {
            Ok(StreamStatus::now(*self.state.read()))
        }
    }

    struct Fixture {
        service: ProxyService,
        metric_store: Arc<MockMetricStore>,
        stream_health: Arc<MockStreamHealth>,
        connected_streams: ConnectedStreams,
    }

    async fn fixture(forward_targets: bool) -> Fixture {
        let cache = MemoizeCache::new(
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
            Arc::new(NoOpMemoizeMetrics),
        );
        let auth_repo = AuthRepo::new(cache.clone());
        auth_repo
            .add(&[AuthConfig {
                api_key: AuthApiKey::new("sdk-key"),
                environment_id: "env-1".to_string(),
            }])
            .await
            .unwrap();

        let flag_repo = FlagRepo::new(cache.clone());
        flag_repo
            .add(
                "env-1",
                vec![FeatureConfig {
                    feature: "dark-mode".to_string(),
                    ..Default::default()
                }],
            )
            .await
            .unwrap();

        let metric_store = Arc::new(MockMetricStore::default());
        let stream_health = Arc::new(MockStreamHealth {
            state: RwLock::new(StreamState::Connected),
        });
        let connected_streams = ConnectedStreams::new();
        let health = Arc::new(ProxyHealth::new(
            ConfigState::Synced,
            stream_health.clone(),
            cache.clone(),
        ));

        let service = ProxyService::new(
            flag_repo,
            SegmentRepo::new(cache.clone()),
            TargetRepo::new(cache.clone()),
            auth_repo,
            TokenSource::new(AuthRepo::new(cache.clone()), b"secret", "1"),
            metric_store.clone(),
            stream_health.clone(),
            connected_streams.clone(),
            health,
            forward_targets,
        );

        Fixture {
            service,
            metric_store,
            stream_health,
            connected_streams,
        }
    }

    #[tokio::test]
    async fn authenticate_returns_token_and_stores_target() {
        let f = fixture(true).await;

        let response = f
            .service
            .authenticate(AuthRequest {
                api_key: "sdk-key".to_string(),
                target: Some(Target {
                    identifier: "user-1".to_string(),
                    name: "User One".to_string(),
                    attributes: Default::default(),
                }),
            })
            .await
            .unwrap();
        assert!(!response.auth_token.is_empty());

        // forward_targets pushes the identity through the metrics pipeline
        let stored = f.metric_store.stored.lock();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].target_data[0].identifier, "user-1");
        assert_eq!(
            f.service.target_repo.get("env-1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_keys() {
        let f = fixture(false).await;
        let err = f
            .service
            .authenticate(AuthRequest {
                api_key: "bogus".to_string(),
                target: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized));
    }

    #[tokio::test]
    async fn reads_are_served_from_cache() {
        let f = fixture(false).await;

        assert_eq!(f.service.feature_configs("env-1").await.unwrap().len(), 1);
        assert_eq!(
            f.service
                .feature_config_by_identifier("env-1", "dark-mode")
                .await
                .unwrap()
                .feature,
            "dark-mode"
        );
        assert!(matches!(
            f.service
                .feature_config_by_identifier("env-1", "missing")
                .await,
            Err(ServiceError::NotFound(_))
        ));
        // reads stay 200-from-cache even while the upstream stream is down
        f.stream_health.set_unhealthy().await.unwrap();
        assert_eq!(f.service.feature_configs("env-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_registers_channel_when_healthy() {
        let f = fixture(false).await;

        let response = f.service.stream("sdk-key").await.unwrap();
        assert_eq!(response.grip_channel, "env-1");
        assert_eq!(f.connected_streams.snapshot(), vec!["env-1".to_string()]);
    }

    #[tokio::test]
    async fn stream_rejected_while_unhealthy() {
        let f = fixture(false).await;
        f.stream_health.set_unhealthy().await.unwrap();

        let err = f.service.stream("sdk-key").await.unwrap_err();
        assert!(matches!(err, ServiceError::StreamUnavailable));
        assert!(f.connected_streams.is_empty());
    }

    #[tokio::test]
    async fn metrics_sets_environment_and_size() {
        let f = fixture(false).await;

        f.service
            .metrics(
                "env-1",
                MetricsRequest {
                    metrics_data: vec![Default::default()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stored = f.metric_store.stored.lock();
        assert_eq!(stored[0].environment_id, "env-1");
        assert!(stored[0].size > 0);
    }
}
