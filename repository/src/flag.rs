use crate::keys;
use cache::{CacheError, MemoizeCache};
use domain::model::FeatureConfig;

/// Stores feature flag configuration per environment. The whole collection
/// is rewritten on refresh so readers always see a consistent snapshot.
#[derive(Clone)]
pub struct FlagRepo {
    cache: MemoizeCache,
}

impl FlagRepo {
    pub fn new(cache: MemoizeCache) -> Self {
        FlagRepo { cache }
    }

    pub async fn add(&self, env: &str, configs: Vec<FeatureConfig>) -> Result<(), CacheError> {
        self.cache.set(&keys::flags(env), &configs).await
    }

    pub async fn get(&self, env: &str) -> Result<Vec<FeatureConfig>, CacheError> {
        Ok(self
            .cache
            .get::<Vec<FeatureConfig>>(&keys::flags(env))
            .await?
            .unwrap_or_default())
    }

    pub async fn get_by_identifier(
        &self,
        env: &str,
        identifier: &str,
    ) -> Result<Option<FeatureConfig>, CacheError> {
        let configs = self.get(env).await?;
        Ok(configs.into_iter().find(|c| c.feature == identifier))
    }

    pub async fn remove(&self, env: &str) -> Result<(), CacheError> {
        self.cache.delete(&keys::flags(env)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{MemoryCache, NoOpMemoizeMetrics};
    use std::sync::Arc;
    use std::time::Duration;

    fn new_repo() -> FlagRepo {
        FlagRepo::new(MemoizeCache::new(
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
            Arc::new(NoOpMemoizeMetrics),
        ))
    }

    fn flag(identifier: &str) -> FeatureConfig {
        FeatureConfig {
            feature: identifier.to_string(),
            environment: "env-1".to_string(),
            version: 1,
            state: "on".to_string(),
            rest: Default::default(),
        }
    }

    #[tokio::test]
    async fn add_get_by_identifier_remove() {
        let repo = new_repo();
        assert!(repo.get("env-1").await.unwrap().is_empty());

        repo.add("env-1", vec![flag("dark-mode"), flag("beta-banner")])
            .await
            .unwrap();

        assert_eq!(repo.get("env-1").await.unwrap().len(), 2);
        assert_eq!(
            repo.get_by_identifier("env-1", "dark-mode")
                .await
                .unwrap()
                .unwrap()
                .feature,
            "dark-mode"
        );
        assert!(
            repo.get_by_identifier("env-1", "unknown")
                .await
                .unwrap()
                .is_none()
        );

        repo.remove("env-1").await.unwrap();
        assert!(repo.get("env-1").await.unwrap().is_empty());
    }
}
