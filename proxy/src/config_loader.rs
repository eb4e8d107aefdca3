use cache::CacheError;
use clients::parse_account_id;
use domain::client::{ClientService, GetProxyConfigInput, UpstreamError};
use domain::model::{AuthApiKey, AuthConfig, Environment, ProxyConfig};
use domain::stream::Stream;
use domain::sync::SharedCredentials;
use repository::{AuthRepo, FlagRepo, InventoryRepo, SegmentRepo};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Width of the per-environment population fan-out.
const POPULATE_CONCURRENCY: usize = 1000;

const CONFIG_PAGE_SIZE: i64 = 10;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed populating repositories: {0}")]
    Populate(String),

    #[error("failed notifying sdks of deleted config: {0}")]
    Notify(String),
}

/// Fetches configuration from the upstream SaaS and rebuilds the
/// repositories from it. Holds the shared upstream credentials that the
/// stream fabric and metrics clients read.
#[derive(Clone)]
pub struct RemoteConfig {
    creds: SharedCredentials,
    client: Arc<dyn ClientService>,
    sse_stream: Arc<dyn Stream>,
    notify_topic: String,
}

impl RemoteConfig {
    pub fn new(
        creds: SharedCredentials,
        client: Arc<dyn ClientService>,
        sse_stream: Arc<dyn Stream>,
        notify_topic: impl Into<String>,
    ) -> Self {
        RemoteConfig {
            creds,
            client,
            sse_stream,
            notify_topic: notify_topic.into(),
        }
    }

    pub fn credentials(&self) -> SharedCredentials {
        self.creds.clone()
    }

    /// Re-authenticates the proxy key and rotates the shared token.
    pub async fn refresh_token(&self) -> Result<String, UpstreamError> {
        let auth = self.client.authenticate_proxy_key(&self.creds.key).await?;
        self.adopt_auth(&auth.token, &auth.cluster_identifier);
        Ok(self.creds.token.get())
    }

    fn adopt_auth(&self, token: &str, cluster_identifier: &str) {
        self.creds.token.set(token.to_string());
        if !cluster_identifier.is_empty() {
            self.creds.cluster.set(cluster_identifier.to_string());
        }
        // Best effort, the account id is only attached to request headers
        if let Some(account_id) = parse_account_id(token) {
            self.creds.account_id.set(account_id);
        }
    }

    /// Authenticates, pages the full proxy config, diffs it against the
    /// stored inventory (publishing delete notifications for anything that
    /// disappeared upstream) and rebuilds the repositories. Returns the ids
    /// of the environments that were populated.
    pub async fn fetch_and_populate(
        &self,
        inventory_repo: &InventoryRepo,
        auth_repo: &AuthRepo,
        flag_repo: &FlagRepo,
        segment_repo: &SegmentRepo,
    ) -> Result<Vec<String>, ConfigError> {
        let auth = self.client.authenticate_proxy_key(&self.creds.key).await?;
        self.adopt_auth(&auth.token, &auth.cluster_identifier);

        let config = self
            .client
            .page_proxy_config(GetProxyConfigInput {
                key: self.creds.key.clone(),
                env_id: String::new(),
                auth_token: self.creds.token.get(),
                cluster_identifier: self.creds.cluster_identifier(),
                page_number: 0,
                page_size: CONFIG_PAGE_SIZE,
            })
            .await?;

        // Compare old and new config assets and delete the difference
        let cleanup = inventory_repo.cleanup(&config).await?;
        if !cleanup.stale_auth_keys.is_empty() {
            auth_repo.remove(&cleanup.stale_auth_keys).await?;
        }
        for msg in &cleanup.notifications {
            self.sse_stream
                .publish(&self.notify_topic, msg)
                .await
                .map_err(|e| ConfigError::Notify(e.to_string()))?;
        }

        let environments: Vec<String> = config
            .iter()
            .flat_map(|page| page.environments.iter().map(|env| env.id.clone()))
            .collect();

        populate(config, auth_repo, flag_repo, segment_repo).await?;
        Ok(environments)
    }
}

/// Rebuilds the repositories from paged config with bounded parallelism:
/// one task per environment behind a counting semaphore. The first failure
/// aborts the run and is surfaced; results of still-running tasks are
/// discarded.
pub async fn populate(
    config: Vec<ProxyConfig>,
    auth_repo: &AuthRepo,
    flag_repo: &FlagRepo,
    segment_repo: &SegmentRepo,
) -> Result<(), ConfigError> {
    let semaphore = Arc::new(Semaphore::new(POPULATE_CONCURRENCY));
    let mut tasks = JoinSet::new();

    for page in config {
        for env in page.environments {
            let semaphore = semaphore.clone();
            let auth_repo = auth_repo.clone();
            let flag_repo = flag_repo.clone();
            let segment_repo = segment_repo.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| ConfigError::Populate(e.to_string()))?;
                populate_environment(&auth_repo, &flag_repo, &segment_repo, env).await
            });
        }
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(e) => {
                tasks.abort_all();
                return Err(ConfigError::Populate(e.to_string()));
            }
        }
    }
    Ok(())
}

async fn populate_environment(
    auth_repo: &AuthRepo,
    flag_repo: &FlagRepo,
    segment_repo: &SegmentRepo,
    env: Environment,
) -> Result<(), ConfigError> {
    // Empty key sets must not insert empty entries
    if !env.api_keys.is_empty() {
        let auth_configs: Vec<AuthConfig> = env
            .api_keys
            .iter()
            .map(|key| AuthConfig {
                api_key: AuthApiKey::new(key),
                environment_id: env.id.clone(),
            })
            .collect();
        let hashed_keys: Vec<String> = auth_configs
            .iter()
            .map(|c| c.api_key.as_str().to_string())
            .collect();

        auth_repo.add(&auth_configs).await?;
        auth_repo
            .add_api_configs_for_environment(&env.id, hashed_keys)
            .await?;
    }

    if !env.feature_configs.is_empty() {
        flag_repo.add(&env.id, env.feature_configs).await?;
    }
    if !env.segments.is_empty() {
        segment_repo.add(&env.id, env.segments).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cache::{MemoizeCache, MemoryCache, NoOpMemoizeMetrics};
    use domain::client::ProxyKeyAuth;
    use domain::message::SseMessage;
    use domain::model::{FeatureConfig, Segment};
    use domain::stream::{MessageHandler, StreamError};
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn repos() -> (MemoizeCache, AuthRepo, FlagRepo, SegmentRepo, InventoryRepo) {
        let cache = MemoizeCache::new(
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
            Arc::new(NoOpMemoizeMetrics),
        );
        (
            cache.clone(),
            AuthRepo::new(cache.clone()),
            FlagRepo::new(cache.clone()),
            SegmentRepo::new(cache.clone()),
            InventoryRepo::new(cache),
        )
    }

    fn environment(id: &str) -> Environment {
        Environment {
            id: id.to_string(),
            identifier: format!("{id}-name"),
            api_keys: vec![format!("{id}-key")],
            feature_configs: vec![FeatureConfig {
                feature: "dark-mode".to_string(),
                ..Default::default()
            }],
            segments: vec![Segment {
                identifier: "beta-users".to_string(),
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn populate_fills_every_repo() {
        let (_cache, auth, flags, segments, _inventory) = repos();
        let config = vec![ProxyConfig {
            environments: vec![environment("env-1"), environment("env-2")],
        }];

        populate(config, &auth, &flags, &segments).await.unwrap();

        for env in ["env-1", "env-2"] {
            assert_eq!(
                auth.get(&AuthApiKey::new(&format!("{env}-key")))
                    .await
                    .unwrap(),
                Some(env.to_string())
            );
            assert_eq!(auth.get_keys_for_environment(env).await.unwrap().len(), 1);
            assert_eq!(flags.get(env).await.unwrap().len(), 1);
            assert_eq!(segments.get(env).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn populate_skips_empty_collections() {
        let (cache, auth, flags, segments, _inventory) = repos();
        let config = vec![ProxyConfig {
            environments: vec![Environment {
                id: "env-1".to_string(),
                ..Default::default()
            }],
        }];

        populate(config, &auth, &flags, &segments).await.unwrap();

        assert!(auth.get_keys_for_environment("env-1").await.unwrap().is_empty());
        assert!(
            cache
                .get::<Vec<FeatureConfig>>("env-env-1-flags")
                .await
                .unwrap()
                .is_none()
        );
    }

    struct MockUpstream {
        config: Mutex<Vec<ProxyConfig>>,
    }

    #[async_trait]
    impl ClientService for MockUpstream {
        async fn authenticate_proxy_key(&self, _key: &str) -> Result<ProxyKeyAuth, UpstreamError> {
            let claims = serde_json::json!({ "account": "acct-1" });
            let token = jsonwebtoken::encode(
                &Header::new(Algorithm::HS256),
                &claims,
                &EncodingKey::from_secret(b"upstream"),
            )
            .unwrap();
            Ok(ProxyKeyAuth {
                token,
                cluster_identifier: "2".to_string(),
            })
        }

        async fn page_proxy_config(
            &self,
            _input: GetProxyConfigInput,
        ) -> Result<Vec<ProxyConfig>, UpstreamError> {
            Ok(self.config.lock().clone())
        }
    }

    #[derive(Default)]
    struct RecordingStream {
        published: Mutex<Vec<(String, SseMessage)>>,
    }

    #[async_trait]
    impl Stream for RecordingStream {
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

    #[tokio::test]
    async fn fetch_and_populate_adopts_credentials_and_notifies_deletes() {
        let (_cache, auth, flags, segments, inventory) = repos();
        let upstream = Arc::new(MockUpstream {
            config: Mutex::new(vec![ProxyConfig {
                environments: vec![environment("env-1")],
            }]),
        });
        let bus = Arc::new(RecordingStream::default());

        let config = RemoteConfig::new(
            SharedCredentials::new("proxy-key"),
            upstream.clone(),
            bus.clone(),
            "proxy:sse_events",
        );

        config
            .fetch_and_populate(&inventory, &auth, &flags, &segments)
            .await
            .unwrap();

        let creds = config.credentials();
        assert!(!creds.token.get().is_empty());
        assert_eq!(creds.cluster_identifier(), "2");
        assert_eq!(creds.account_id.get(), "acct-1");
        assert!(bus.published.lock().is_empty());

        // Drop the flag upstream; the next fetch publishes a delete
        // notification and removes the stale auth key
        upstream.config.lock()[0].environments[0].feature_configs.clear();
        upstream.config.lock()[0].environments[0].api_keys.clear();

        config
            .fetch_and_populate(&inventory, &auth, &flags, &segments)
            .await
            .unwrap();

        let published = bus.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "proxy:sse_events");
        assert_eq!(published[0].1.identifier, "dark-mode");
        assert_eq!(
            auth.get(&AuthApiKey::new("env-1-key")).await.unwrap(),
            None
        );
    }
}
