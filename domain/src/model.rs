use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;

pub type EnvironmentId = String;

/// A hashed SDK API key of the form `auth-key-<sha256 hex>`.
///
/// The prefix is part of the persisted cache layout, so the full prefixed
/// value is what gets stored and compared everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthApiKey(pub String);

impl AuthApiKey {
    /// Hashes a raw SDK key into its cache representation.
    pub fn new(raw_key: &str) -> Self {
        let digest = Sha256::digest(raw_key.as_bytes());
        AuthApiKey(format!("auth-key-{}", hex(&digest)))
    }

    /// Wraps an already hashed key, e.g. one read back from an offline config
    /// export.
    pub fn from_hashed(hashed: &str) -> Self {
        AuthApiKey(format!("auth-key-{hashed}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AuthApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        },
    )
}

/// Maps a hashed API key to the environment it authenticates against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub api_key: AuthApiKey,
    pub environment_id: EnvironmentId,
}

/// A feature flag configuration as served to SDKs.
///
/// The relay never evaluates rules, so everything beyond the identity and
/// version is carried opaquely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureConfig {
    pub feature: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub state: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// A target group (segment) configuration, carried opaquely beyond identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// A target identity registered by an SDK during authentication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// One environment's worth of upstream configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: EnvironmentId,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub feature_configs: Vec<FeatureConfig>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

/// The pagination unit returned by the upstream client. Authoritative on
/// fetch; repositories are rebuilt from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub environments: Vec<Environment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_key_with_prefix() {
        let key = AuthApiKey::new("my-key");
        assert!(key.as_str().starts_with("auth-key-"));
        // sha256 hex is 64 chars
        assert_eq!(key.as_str().len(), "auth-key-".len() + 64);
        // deterministic
        assert_eq!(key, AuthApiKey::new("my-key"));
        assert_ne!(key, AuthApiKey::new("other-key"));
    }

    #[test]
    fn wraps_pre_hashed_key() {
        let raw = AuthApiKey::new("my-key");
        let hashed = raw.as_str().trim_start_matches("auth-key-");
        assert_eq!(AuthApiKey::from_hashed(hashed), raw);
    }

    #[test]
    fn feature_config_keeps_unknown_fields() {
        let json = r#"{"feature":"bool-flag","version":3,"state":"on","variations":[{"identifier":"true"}]}"#;
        let config: FeatureConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.feature, "bool-flag");
        assert_eq!(config.version, 3);
        assert!(config.rest.contains_key("variations"));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["variations"][0]["identifier"], "true");
    }
}
