use crate::keys;
use cache::{CacheError, MemoizeCache};
use domain::model::Target;

/// Stores target identities registered by SDKs during authentication.
#[derive(Clone)]
pub struct TargetRepo {
    cache: MemoizeCache,
}

impl TargetRepo {
    pub fn new(cache: MemoizeCache) -> Self {
        TargetRepo { cache }
    }

    /// Merges targets into the environment's set, newest attributes winning
    /// for an existing identifier.
    pub async fn add(&self, env: &str, targets: Vec<Target>) -> Result<(), CacheError> {
        let mut existing = self.get(env).await?;
        for target in targets {
            match existing
                .iter_mut()
                .find(|t| t.identifier == target.identifier)
            {
                Some(slot) => *slot = target,
                None => existing.push(target),
            }
        }
        self.cache.set(&keys::targets(env), &existing).await
    }

    pub async fn get(&self, env: &str) -> Result<Vec<Target>, CacheError> {
        Ok(self
            .cache
            .get::<Vec<Target>>(&keys::targets(env))
            .await?
            .unwrap_or_default())
    }

    pub async fn remove(&self, env: &str) -> Result<(), CacheError> {
        self.cache.delete(&keys::targets(env)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{MemoryCache, NoOpMemoizeMetrics};
    use std::sync::Arc;
    use std::time::Duration;

    fn new_repo() -> TargetRepo {
        TargetRepo::new(MemoizeCache::new(
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
            Arc::new(NoOpMemoizeMetrics),
        ))
    }

    #[tokio::test]
    async fn add_merges_by_identifier() {
        let repo = new_repo();

        repo.add(
            "env-1",
            vec![Target {
                identifier: "user-1".to_string(),
                name: "User One".to_string(),
                attributes: Default::default(),
            }],
        )
        .await
        .unwrap();

        // re-registering the same identifier replaces it
        repo.add(
            "env-1",
            vec![
                Target {
                    identifier: "user-1".to_string(),
                    name: "User 1".to_string(),
                    attributes: Default::default(),
                },
                Target {
                    identifier: "user-2".to_string(),
                    name: "User Two".to_string(),
                    attributes: Default::default(),
                },
            ],
        )
        .await
        .unwrap();

        let targets = repo.get("env-1").await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "User 1");
    }
}
