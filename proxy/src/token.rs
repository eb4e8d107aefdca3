use cache::CacheError;
use domain::model::AuthApiKey;
use domain::status::unix_now;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use repository::AuthRepo;
use serde::{Deserialize, Serialize};

/// Claims carried by an edge auth token. Given the same key, secret and
/// issue time the token is byte-for-byte deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub env: String,
    #[serde(rename = "environmentIdentifier")]
    pub environment_identifier: String,
    #[serde(rename = "clusterIdentifier")]
    pub cluster_identifier: String,
    pub key_type: String,
    pub iat: i64,
}

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("key not authorized")]
    NotAuthorized,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed signing token: {0}")]
    Sign(String),

    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Issues and validates edge bearer tokens. Keys are hashed with SHA-256 and
/// looked up in the auth repo; tokens are HMAC-SHA-256 signed with the
/// process-wide secret injected at startup.
pub struct TokenSource {
    auth_repo: AuthRepo,
    secret: Vec<u8>,
    cluster_identifier: String,
}

impl TokenSource {
    pub fn new(auth_repo: AuthRepo, secret: &[u8], cluster_identifier: impl Into<String>) -> Self {
        TokenSource {
            auth_repo,
            secret: secret.to_vec(),
            cluster_identifier: cluster_identifier.into(),
        }
    }

    pub async fn generate_token(&self, api_key: &str) -> Result<(String, Claims), TokenError> {
        self.generate_token_at(api_key, unix_now()).await
    }

    pub async fn generate_token_at(
        &self,
        api_key: &str,
        issued_at: i64,
    ) -> Result<(String, Claims), TokenError> {
        let hashed = AuthApiKey::new(api_key);
        let env = self
            .auth_repo
            .get(&hashed)
            .await?
            .ok_or(TokenError::NotAuthorized)?;

        let claims = Claims {
            env: env.clone(),
            environment_identifier: env,
            cluster_identifier: self.cluster_identifier.clone(),
            key_type: "Server".to_string(),
            iat: issued_at,
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| TokenError::Sign(e.to_string()))?;

        Ok((token, claims))
    }
}

/// Validates an edge token's signature and returns its claims.
pub fn parse_token(token: &str, secret: &[u8]) -> Result<Claims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.required_spec_claims = Default::default();

    jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|e| TokenError::Invalid(e.to_string()))
}
