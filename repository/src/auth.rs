use crate::keys;
use cache::{CacheError, MemoizeCache};
use domain::model::{AuthApiKey, AuthConfig, EnvironmentId};

/// Whether a key list patch adds or removes the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyListOp {
    Add,
    Remove,
}

/// Maps hashed API keys to environments and maintains the per-environment
/// key list used for removal and export.
#[derive(Clone)]
pub struct AuthRepo {
    cache: MemoizeCache,
}

impl AuthRepo {
    pub fn new(cache: MemoizeCache) -> Self {
        AuthRepo { cache }
    }

    pub async fn add(&self, configs: &[AuthConfig]) -> Result<(), CacheError> {
        for config in configs {
            self.cache
                .set(config.api_key.as_str(), &config.environment_id)
                .await?;
        }
        Ok(())
    }

    /// The environment a hashed key authenticates against, if any.
    pub async fn get(&self, key: &AuthApiKey) -> Result<Option<EnvironmentId>, CacheError> {
        self.cache.get(key.as_str()).await
    }

    pub async fn remove(&self, keys: &[AuthApiKey]) -> Result<(), CacheError> {
        for key in keys {
            self.cache.delete(key.as_str()).await?;
        }
        Ok(())
    }

    /// Replaces the list of hashed keys for an environment.
    pub async fn add_api_configs_for_environment(
        &self,
        env: &str,
        hashed_keys: Vec<String>,
    ) -> Result<(), CacheError> {
        self.cache.set(&keys::api_keys(env), &hashed_keys).await
    }

    pub async fn get_keys_for_environment(&self, env: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .cache
            .get::<Vec<String>>(&keys::api_keys(env))
            .await?
            .unwrap_or_default())
    }

    /// Adds or removes one hashed key from an environment's key list.
    pub async fn patch_api_config_for_environment(
        &self,
        env: &str,
        key: &AuthApiKey,
        op: KeyListOp,
    ) -> Result<(), CacheError> {
        let mut list = self.get_keys_for_environment(env).await?;
        match op {
            KeyListOp::Add => {
                if !list.iter().any(|k| k == key.as_str()) {
                    list.push(key.as_str().to_string());
                }
            }
            KeyListOp::Remove => list.retain(|k| k != key.as_str()),
        }
        self.cache.set(&keys::api_keys(env), &list).await
    }

    /// Removes every auth record for an environment along with its key list.
    pub async fn remove_all_keys_for_environment(&self, env: &str) -> Result<(), CacheError> {
        for key in self.get_keys_for_environment(env).await? {
            self.cache.delete(&key).await?;
        }
        self.cache.delete(&keys::api_keys(env)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{MemoryCache, NoOpMemoizeMetrics};
    use std::sync::Arc;
    use std::time::Duration;

    fn new_repo() -> AuthRepo {
        AuthRepo::new(MemoizeCache::new(
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
            Arc::new(NoOpMemoizeMetrics),
        ))
    }

    #[tokio::test]
    async fn add_get_remove() {
        let repo = new_repo();
        let key = AuthApiKey::new("sdk-key");

        assert_eq!(repo.get(&key).await.unwrap(), None);

        repo.add(&[AuthConfig {
            api_key: key.clone(),
            environment_id: "env-1".to_string(),
        }])
        .await
        .unwrap();
        assert_eq!(repo.get(&key).await.unwrap(), Some("env-1".to_string()));

        repo.remove(std::slice::from_ref(&key)).await.unwrap();
        assert_eq!(repo.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn patch_key_list() {
        let repo = new_repo();
        let key = AuthApiKey::new("sdk-key");

        repo.patch_api_config_for_environment("env-1", &key, KeyListOp::Add)
            .await
            .unwrap();
        // adding twice keeps the list deduplicated
        repo.patch_api_config_for_environment("env-1", &key, KeyListOp::Add)
            .await
            .unwrap();
        assert_eq!(
            repo.get_keys_for_environment("env-1").await.unwrap(),
            vec![key.as_str().to_string()]
        );

        repo.patch_api_config_for_environment("env-1", &key, KeyListOp::Remove)
            .await
            .unwrap();
        assert!(
            repo.get_keys_for_environment("env-1")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn remove_all_keys_for_environment() {
        let repo = new_repo();
        let key_a = AuthApiKey::new("key-a");
        let key_b = AuthApiKey::new("key-b");

        repo.add(&[
            AuthConfig {
                api_key: key_a.clone(),
                environment_id: "env-1".to_string(),
            },
            AuthConfig {
                api_key: key_b.clone(),
                environment_id: "env-1".to_string(),
            },
        ])
        .await
        .unwrap();
        repo.add_api_configs_for_environment(
            "env-1",
            vec![key_a.as_str().to_string(), key_b.as_str().to_string()],
        )
        .await
        .unwrap();

        repo.remove_all_keys_for_environment("env-1").await.unwrap();

        assert_eq!(repo.get(&key_a).await.unwrap(), None);
        assert_eq!(repo.get(&key_b).await.unwrap(), None);
        assert!(
            repo.get_keys_for_environment("env-1")
                .await
                .unwrap()
                .is_empty()
        );
    }
}
