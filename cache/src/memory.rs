use crate::{Cache, CacheError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// In-process `Cache` implementation used for offline mode and tests. TTLs
/// are ignored; offline data has no expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get_raw("missing").await.unwrap(), None);

        cache
            .set_raw("key", b"value".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(cache.get_raw("key").await.unwrap(), Some(b"value".to_vec()));

        cache.delete("key").await.unwrap();
        assert_eq!(cache.get_raw("key").await.unwrap(), None);
    }
}
