use crate::metrics_defs::CONFIG_PAGE_FETCHES;
use async_trait::async_trait;
use domain::client::{ClientService, GetProxyConfigInput, ProxyKeyAuth, UpstreamError};
use domain::model::{Environment, ProxyConfig};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const AUTH_DEADLINE: Duration = Duration::from_secs(30);
const PAGE_DEADLINE: Duration = Duration::from_secs(5 * 60);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthProxyKeyRequest<'a> {
    proxy_key: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthProxyKeyResponse {
    token: String,
    #[serde(default)]
    cluster_identifier: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProxyConfigPage {
    #[serde(default)]
    page_count: i64,
    #[serde(default)]
    environments: Vec<Environment>,
}

/// HTTP client for the upstream config service: proxy key authentication and
/// paginated proxy-config fetches.
pub struct HttpClientService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpClientService {
    pub fn new(base_url: impl Into<String>) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;
        Ok(HttpClientService {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_page(
        &self,
        input: &GetProxyConfigInput,
        page_number: i64,
    ) -> Result<ProxyConfigPage, UpstreamError> {
        let mut request = self
            .http
            .get(format!("{}/proxy/config", self.base_url))
            .bearer_auth(&input.auth_token)
            .query(&[
                ("pageNumber", page_number.to_string()),
                ("pageSize", input.page_size.to_string()),
                ("cluster", input.cluster_identifier.clone()),
                ("key", input.key.clone()),
            ]);
        if !input.env_id.is_empty() {
            request = request.query(&[("environment", input.env_id.clone())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        let status = response.status();
        metrics::counter!(CONFIG_PAGE_FETCHES.name, "status" => status.as_u16().to_string())
            .increment(1);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UpstreamError::Unauthorized),
            s if !s.is_success() => Err(UpstreamError::ConfigFetch(format!(
                "upstream returned {s} for page {page_number}"
            ))),
            _ => response
                .json::<ProxyConfigPage>()
                .await
                .map_err(|e| UpstreamError::ConfigFetch(e.to_string())),
        }
    }

    async fn page_all(
        &self,
        input: &GetProxyConfigInput,
    ) -> Result<Vec<ProxyConfig>, UpstreamError> {
        let mut config = Vec::new();
        let mut page_number = input.page_number;

        loop {
            let page = self.fetch_page(input, page_number).await?;
            if page.environments.is_empty() {
                break;
            }

            let page_count = page.page_count;
            config.push(ProxyConfig {
                environments: page.environments,
            });

            page_number += 1;
            if page_count > 0 && page_number >= page_count {
                break;
            }
        }

        tracing::info!(pages = config.len(), "fetched proxy config from upstream");
        Ok(config)
    }
}

#[async_trait]
impl ClientService for HttpClientService {
    async fn authenticate_proxy_key(&self, key: &str) -> Result<ProxyKeyAuth, UpstreamError> {
        let response = self
            .http
            .post(format!("{}/proxy/auth", self.base_url))
            .timeout(AUTH_DEADLINE)
            .json(&AuthProxyKeyRequest { proxy_key: key })
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UpstreamError::Unauthorized),
            s if !s.is_success() => Err(UpstreamError::Unreachable(format!(
                "upstream auth returned {s}"
            ))),
            _ => {
                let body: AuthProxyKeyResponse = response
                    .json()
                    .await
                    .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;
                Ok(ProxyKeyAuth {
                    token: body.token,
                    cluster_identifier: body.cluster_identifier,
                })
            }
        }
    }

    async fn page_proxy_config(
        &self,
        input: GetProxyConfigInput,
    ) -> Result<Vec<ProxyConfig>, UpstreamError> {
        tokio::time::timeout(PAGE_DEADLINE, self.page_all(&input))
            .await
            .map_err(|_| {
                UpstreamError::ConfigFetch("timed out paging proxy config".to_string())
            })?
    }
}

/// Best-effort extraction of the `account` claim from the upstream auth
/// token. The signature is not verified; the token was just handed to us by
/// the upstream over TLS and the account id is only used for headers.
pub fn parse_account_id(token: &str) -> Option<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims = Default::default();

    let data =
        jsonwebtoken::decode::<serde_json::Value>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()?;
    data.claims
        .get("account")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    #[test]
    fn parses_account_claim() {
        let claims = serde_json::json!({ "account": "acct-123", "iat": 1712000000 });
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"whatever"),
        )
        .unwrap();

        assert_eq!(parse_account_id(&token), Some("acct-123".to_string()));
    }

    #[test]
    fn missing_account_claim_is_none() {
        let claims = serde_json::json!({ "iat": 1712000000 });
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"whatever"),
        )
        .unwrap();

        assert_eq!(parse_account_id(&token), None);
        assert_eq!(parse_account_id("not-a-token"), None);
    }
}
