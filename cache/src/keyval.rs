use crate::{Cache, CacheError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// `Cache` implementation backed by the shared Redis store.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub fn new(manager: ConnectionManager) -> Self {
        RedisCache { manager }
    }
}

/// Normalizes a configured address into a connection URL. Addresses may be
/// comma separated; `rediss://` keeps TLS enabled.
pub fn connection_url(address: &str) -> String {
    let first = address.split(',').next().unwrap_or(address).trim();
    if first.starts_with("redis://") || first.starts_with("rediss://") {
        return first.to_string();
    }
    format!("redis://{first}")
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl
            && !ttl.is_zero()
        {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        if pong != "PONG" {
            return Err(CacheError::Unavailable(format!(
                "unexpected ping reply: {pong}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_connection_urls() {
        assert_eq!(connection_url("localhost:6379"), "redis://localhost:6379");
        assert_eq!(
            connection_url("redis://localhost:6379"),
            "redis://localhost:6379"
        );
        assert_eq!(
            connection_url("rediss://cache.internal:6380"),
            "rediss://cache.internal:6380"
        );
        // comma separated lists connect to the first entry
        assert_eq!(
            connection_url("cache-0:6379,cache-1:6379"),
            "redis://cache-0:6379"
        );
    }
}
