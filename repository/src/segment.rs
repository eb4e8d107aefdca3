use crate::keys;
use cache::{CacheError, MemoizeCache};
use domain::model::Segment;

/// Stores target group (segment) configuration per environment.
#[derive(Clone)]
pub struct SegmentRepo {
    cache: MemoizeCache,
}

impl SegmentRepo {
    pub fn new(cache: MemoizeCache) -> Self {
        SegmentRepo { cache }
    }

    pub async fn add(&self, env: &str, segments: Vec<Segment>) -> Result<(), CacheError> {
        self.cache.set(&keys::segments(env), &segments).await
    }

    pub async fn get(&self, env: &str) -> Result<Vec<Segment>, CacheError> {
        Ok(self
            .cache
            .get::<Vec<Segment>>(&keys::segments(env))
            .await?
            .unwrap_or_default())
    }

    pub async fn get_by_identifier(
        &self,
        env: &str,
        identifier: &str,
    ) -> Result<Option<Segment>, CacheError> {
        let segments = self.get(env).await?;
        Ok(segments.into_iter().find(|s| s.identifier == identifier))
    }

    pub async fn remove(&self, env: &str) -> Result<(), CacheError> {
        self.cache.delete(&keys::segments(env)).await
    }
}
