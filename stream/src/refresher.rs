use crate::metrics_defs::REFRESHED_EVENTS;
use async_trait::async_trait;
use cache::CacheError;
use domain::client::{ClientService, GetProxyConfigInput, UpstreamError};
use domain::message::{SseMessage, msg_domain, msg_event};
use domain::model::{AuthApiKey, AuthConfig, ProxyConfig};
use domain::stream::{DynError, MessageHandler};
use domain::sync::SharedCredentials;
use futures::future::BoxFuture;
use repository::{AuthRepo, FlagRepo, KeyListOp, SegmentRepo};
use std::sync::Arc;

const CONFIG_PAGE_SIZE: i64 = 10;

/// Populates the repositories from freshly paged config. Injected as a
/// closure to break the cycle between the refresher and the config loader.
pub type PopulateFn =
    Arc<dyn Fn(Vec<ProxyConfig>) -> BoxFuture<'static, Result<(), DynError>> + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum RefreshError {
    #[error("unexpected message domain: {0}")]
    UnexpectedMessageDomain(String),

    #[error("unexpected event type {event:?} for {domain} message")]
    UnexpectedEventType { domain: String, event: String },

    #[error("unable to fetch config for environment {env}: {source}")]
    ConfigFetch { env: String, source: UpstreamError },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed populating repositories: {0}")]
    Populate(String),
}

/// Translates change events from the upstream SSE stream into cache
/// mutations. Runs on the Primary only, at the end of the forwarder chain so
/// cache reconciliation never blocks the fan-out.
pub struct Refresher {
    client: Arc<dyn ClientService>,
    creds: SharedCredentials,
    auth_repo: AuthRepo,
    flag_repo: FlagRepo,
    segment_repo: SegmentRepo,
    populate: PopulateFn,
}

impl Refresher {
    pub fn new(
        client: Arc<dyn ClientService>,
        creds: SharedCredentials,
        auth_repo: AuthRepo,
        flag_repo: FlagRepo,
        segment_repo: SegmentRepo,
        populate: PopulateFn,
    ) -> Self {
        Refresher {
            client,
            creds,
            auth_repo,
            flag_repo,
            segment_repo,
            populate,
        }
    }

    async fn handle(&self, msg: &SseMessage) -> Result<(), RefreshError> {
        metrics::counter!(REFRESHED_EVENTS.name, "domain" => msg.domain.clone()).increment(1);

        match msg.domain.as_str() {
            msg_domain::FLAG => handle_flag_message(msg),
            msg_domain::TARGET_SEGMENT => handle_segment_message(msg),
            msg_domain::PROXY => self.handle_proxy_message(msg).await,
            other => Err(RefreshError::UnexpectedMessageDomain(other.to_string())),
        }
    }

    async fn handle_proxy_message(&self, msg: &SseMessage) -> Result<(), RefreshError> {
        match msg.event.as_str() {
            msg_event::PROXY_KEY_DELETED => {
                // Reserved upstream event, semantics are not defined yet
                tracing::warn!("received proxy-key-deleted event, ignoring");
                Ok(())
            }
            msg_event::ENVIRONMENT_ADDED => {
                self.handle_environments_added(&msg.environments).await
            }
            msg_event::ENVIRONMENT_REMOVED => {
                self.handle_environments_removed(&msg.environments).await
            }
            msg_event::API_KEY_ADDED => {
                let Some(env) = msg.environments.first() else {
                    return Ok(());
                };
                self.handle_api_key_added(env, &msg.api_key).await
            }
            msg_event::API_KEY_REMOVED => {
                let Some(env) = msg.environments.first() else {
                    return Ok(());
                };
                self.handle_api_key_removed(env, &msg.api_key).await
            }
            other => Err(RefreshError::UnexpectedEventType {
                domain: "proxy".to_string(),
                event: other.to_string(),
            }),
        }
    }

    /// Pages the upstream config for every added environment and populates
    /// the repositories from it.
    async fn handle_environments_added(&self, environments: &[String]) -> Result<(), RefreshError> {
        for env in environments {
            let input = GetProxyConfigInput {
                key: self.creds.key.clone(),
                env_id: env.clone(),
                auth_token: self.creds.token.get(),
                cluster_identifier: self.creds.cluster_identifier(),
                page_number: 0,
                page_size: CONFIG_PAGE_SIZE,
            };

            let config = self.client.page_proxy_config(input).await.map_err(|e| {
                tracing::error!(environment = %env, "unable to fetch config for the environment");
                RefreshError::ConfigFetch {
                    env: env.clone(),
                    source: e,
                }
            })?;

            (self.populate)(config)
                .await
                .map_err(|e| RefreshError::Populate(e.to_string()))?;
        }
        Ok(())
    }

    async fn handle_environments_removed(
        &self,
        environments: &[String],
    ) -> Result<(), RefreshError> {
        for env in environments {
            tracing::debug!(environment = %env, "removing entries for environment");
            self.auth_repo.remove_all_keys_for_environment(env).await?;
            self.flag_repo.remove(env).await?;
            self.segment_repo.remove(env).await?;
        }
        Ok(())
    }

    async fn handle_api_key_added(&self, env: &str, api_key: &str) -> Result<(), RefreshError> {
        tracing::debug!(environment = %env, "adding api key entry for environment");

        let key = AuthApiKey::new(api_key);
        self.auth_repo
            .add(&[AuthConfig {
                api_key: key.clone(),
                environment_id: env.to_string(),
            }])
            .await?;
        self.auth_repo
            .patch_api_config_for_environment(env, &key, KeyListOp::Add)
            .await?;
        Ok(())
    }

    async fn handle_api_key_removed(&self, env: &str, api_key: &str) -> Result<(), RefreshError> {
        tracing::debug!(environment = %env, "removing api key entry for environment");

        let key = AuthApiKey::new(api_key);
        self.auth_repo.remove(std::slice::from_ref(&key)).await?;
        self.auth_repo
            .patch_api_config_for_environment(env, &key, KeyListOp::Remove)
            .await?;
        Ok(())
    }
}

/// Flag events only validate the event type for now: full refresh covers
/// staleness, targeted eviction hooks in here once per-identifier caching
/// lands.
fn handle_flag_message(msg: &SseMessage) -> Result<(), RefreshError> {
    match msg.event.as_str() {
        msg_event::CREATE | msg_event::PATCH | msg_event::DELETE => Ok(()),
        other => Err(RefreshError::UnexpectedEventType {
            domain: "flag".to_string(),
            event: other.to_string(),
        }),
    }
}

fn handle_segment_message(msg: &SseMessage) -> Result<(), RefreshError> {
    match msg.event.as_str() {
        msg_event::CREATE | msg_event::PATCH | msg_event::DELETE => Ok(()),
        other => Err(RefreshError::UnexpectedEventType {
            domain: "target-segment".to_string(),
            event: other.to_string(),
        }),
    }
}

#[async_trait]
impl MessageHandler for Refresher {
    async fn handle_message(&self, msg: &SseMessage) -> Result<(), DynError> {
        self.handle(msg).await.map_err(|e| Box::new(e) as DynError)
    }
}
