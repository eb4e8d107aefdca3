use crate::model::ProxyConfig;
use async_trait::async_trait;

/// Result of authenticating the relay's proxy key against the upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyKeyAuth {
    pub token: String,
    pub cluster_identifier: String,
}

/// Parameters for one proxy-config pagination run. An empty `env_id` fetches
/// every environment the proxy key grants access to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetProxyConfigInput {
    pub key: String,
    pub env_id: String,
    pub auth_token: String,
    pub cluster_identifier: String,
    pub page_number: i64,
    pub page_size: i64,
}

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("not authorized by upstream")]
    Unauthorized,

    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("failed fetching config: {0}")]
    ConfigFetch(String),
}

/// The upstream SaaS surface the relay depends on.
#[async_trait]
pub trait ClientService: Send + Sync {
    async fn authenticate_proxy_key(&self, key: &str) -> Result<ProxyKeyAuth, UpstreamError>;

    async fn page_proxy_config(
        &self,
        input: GetProxyConfigInput,
    ) -> Result<Vec<ProxyConfig>, UpstreamError>;
}
