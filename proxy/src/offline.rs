//! Offline config: loading environments from a config directory instead of
//! the upstream, and exporting the current cache content to disk.
//!
//! Layout: one `env-<id>/` directory per environment holding
//! `feature_configs.json`, `segments.json`, `targets.json` and
//! `api_keys.json` (hashed keys, without the `auth-key-` prefix).

use cache::CacheError;
use domain::model::{AuthApiKey, AuthConfig, FeatureConfig, Segment, Target};
use repository::{AuthRepo, FlagRepo, SegmentRepo, TargetRepo};
use serde::de::DeserializeOwned;
use std::path::Path;

const FEATURES_FILE: &str = "feature_configs.json";
const SEGMENTS_FILE: &str = "segments.json";
const TARGETS_FILE: &str = "targets.json";
const API_KEYS_FILE: &str = "api_keys.json";

#[derive(thiserror::Error, Debug)]
pub enum OfflineError {
    #[error("config dir error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed decoding {file}: {reason}")]
    Decode { file: String, reason: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed encoding {file}: {reason}")]
    Encode { file: String, reason: String },
}

/// One environment's worth of offline config.
#[derive(Debug, Default, Clone)]
pub struct OfflineEnvironment {
    pub id: String,
    pub api_keys: Vec<String>,
    pub feature_configs: Vec<FeatureConfig>,
    pub segments: Vec<Segment>,
    pub targets: Vec<Target>,
}

/// Reads every `env-*` directory under `dir`.
pub fn load_config_dir(dir: &Path) -> Result<Vec<OfflineEnvironment>, OfflineError> {
    let mut environments = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = name.strip_prefix("env-") else {
            continue;
        };

        let path = entry.path();
        environments.push(OfflineEnvironment {
            id: id.to_string(),
            api_keys: read_json_or_default(&path.join(API_KEYS_FILE))?,
            feature_configs: read_json_or_default(&path.join(FEATURES_FILE))?,
            segments: read_json_or_default(&path.join(SEGMENTS_FILE))?,
            targets: read_json_or_default(&path.join(TARGETS_FILE))?,
        });
    }

    tracing::info!(environments = environments.len(), dir = %dir.display(), "loaded offline config");
    Ok(environments)
}

/// Populates the repositories from offline config. Keys on disk are already
/// hashed, so no hashing happens here.
pub async fn populate_offline(
    environments: Vec<OfflineEnvironment>,
    auth_repo: &AuthRepo,
    flag_repo: &FlagRepo,
    segment_repo: &SegmentRepo,
    target_repo: &TargetRepo,
) -> Result<(), OfflineError> {
    for env in environments {
        if !env.api_keys.is_empty() {
            let configs: Vec<AuthConfig> = env
                .api_keys
                .iter()
                .map(|hashed| AuthConfig {
                    api_key: AuthApiKey::from_hashed(hashed),
                    environment_id: env.id.clone(),
                })
                .collect();
            let key_list = configs
                .iter()
                .map(|c| c.api_key.as_str().to_string())
                .collect();
            auth_repo.add(&configs).await?;
            auth_repo
                .add_api_configs_for_environment(&env.id, key_list)
                .await?;
        }

        if !env.feature_configs.is_empty() {
            flag_repo.add(&env.id, env.feature_configs).await?;
        }
        if !env.segments.is_empty() {
            segment_repo.add(&env.id, env.segments).await?;
        }
        if !env.targets.is_empty() {
            target_repo.add(&env.id, env.targets).await?;
        }
    }
    Ok(())
}

/// Dumps the cached config for the given environments to `dir`.
pub async fn export(
    dir: &Path,
    environments: &[String],
    auth_repo: &AuthRepo,
    flag_repo: &FlagRepo,
    segment_repo: &SegmentRepo,
    target_repo: &TargetRepo,
) -> Result<(), OfflineError> {
    std::fs::create_dir_all(dir)?;

    for env in environments {
        let env_dir = dir.join(format!("env-{env}"));
        std::fs::create_dir_all(&env_dir)?;

        // Strip the auth-key prefix; the loader re-wraps it
        let api_keys: Vec<String> = auth_repo
            .get_keys_for_environment(env)
            .await?
            .into_iter()
            .map(|k| k.trim_start_matches("auth-key-").to_string())
            .collect();

        write_json(&env_dir.join(API_KEYS_FILE), &api_keys)?;
        write_json(&env_dir.join(FEATURES_FILE), &flag_repo.get(env).await?)?;
        write_json(&env_dir.join(SEGMENTS_FILE), &segment_repo.get(env).await?)?;
        write_json(&env_dir.join(TARGETS_FILE), &target_repo.get(env).await?)?;
    }

    tracing::info!(environments = environments.len(), dir = %dir.display(), "exported offline config");
    Ok(())
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, OfflineError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| OfflineError::Decode {
            file: path.display().to_string(),
            reason: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(OfflineError::Io(e)),
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), OfflineError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| OfflineError::Encode {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;
    std::fs::write(path, bytes)?;
    Ok(())
}
