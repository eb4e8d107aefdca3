use crate::metrics_defs::{
    MEMOIZE_HIT, MEMOIZE_HIT_WITH_UNMARSHAL, MEMOIZE_MISS, MEMOIZE_WRITE_MARSHAL,
};
use crate::{Cache, CacheError};
use md5::{Digest, Md5};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

type PayloadDigest = [u8; 16];

/// Counters tracking memoize cache activity. A trait so tests can observe
/// counts without a recorder installed.
pub trait MemoizeMetrics: Send + Sync {
    /// The raw bytes hit the memoize cache and no decode was performed.
    fn hit_inc(&self);

    /// The raw bytes weren't in the memoize cache and a full decode ran.
    fn miss_inc(&self);

    /// An object was encoded to bytes and staged for future hits.
    fn write_marshal_inc(&self);

    /// The raw bytes hit the memoize cache but a decode still ran. This
    /// shouldn't happen; the counter surfaces it if it does.
    fn hit_with_unmarshal_inc(&self);
}

/// Default metrics emitting to the installed recorder.
pub struct CounterMemoizeMetrics;

impl MemoizeMetrics for CounterMemoizeMetrics {
    fn hit_inc(&self) {
        metrics::counter!(MEMOIZE_HIT.name).increment(1);
    }

    fn miss_inc(&self) {
        metrics::counter!(MEMOIZE_MISS.name).increment(1);
    }

    fn write_marshal_inc(&self) {
        metrics::counter!(MEMOIZE_WRITE_MARSHAL.name).increment(1);
    }

    fn hit_with_unmarshal_inc(&self) {
        metrics::counter!(MEMOIZE_HIT_WITH_UNMARSHAL.name).increment(1);
    }
}

pub struct NoOpMemoizeMetrics;

impl MemoizeMetrics for NoOpMemoizeMetrics {
    fn hit_inc(&self) {}
    fn miss_inc(&self) {}
    fn write_marshal_inc(&self) {}
    fn hit_with_unmarshal_inc(&self) {}
}

/// A read-through decorator over a [`Cache`] that maps raw bytes to a
/// previously decoded object so identical payloads are never decoded twice.
///
/// On write the value is serialized, its digest computed, and the live object
/// staged in an in-process expiring map keyed by digest. On read the fetched
/// bytes are digested again; a hit returns a copy of the staged object
/// without decoding.
#[derive(Clone)]
pub struct MemoizeCache {
    inner: Arc<dyn Cache>,
    decoded: moka::sync::Cache<PayloadDigest, Arc<dyn Any + Send + Sync>>,
    metrics: Arc<dyn MemoizeMetrics>,
    ttl: Option<Duration>,
}

impl MemoizeCache {
    pub fn new(
        inner: Arc<dyn Cache>,
        default_expiration: Duration,
        metrics: Arc<dyn MemoizeMetrics>,
    ) -> Self {
        let decoded = moka::sync::Cache::builder()
            .time_to_live(default_expiration)
            .build();

        MemoizeCache {
            inner,
            decoded,
            metrics,
            ttl: None,
        }
    }

    /// Sets the TTL applied to entries persisted in the parent store. The
    /// in-process map keeps its own expiry.
    pub fn with_parent_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub async fn set<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Encode {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let digest: PayloadDigest = Md5::digest(&bytes).into();
        self.decoded.insert(digest, Arc::new(value.clone()));
        self.metrics.write_marshal_inc();

        self.inner.set_raw(key, bytes, self.ttl).await
    }

    pub async fn get<T>(&self, key: &str) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let Some(bytes) = self.inner.get_raw(key).await? else {
            return Ok(None);
        };

        let digest: PayloadDigest = Md5::digest(&bytes).into();
        if let Some(staged) = self.decoded.get(&digest) {
            if let Some(value) = staged.downcast_ref::<T>() {
                // Hit for the bytes in the memoize cache, return a copy and
                // skip decoding entirely.
                self.metrics.hit_inc();
                return Ok(Some(value.clone()));
            }

            // Same bytes staged under a different type, decode after all.
            self.metrics.hit_with_unmarshal_inc();
            return decode::<T>(key, &bytes).map(Some);
        }

        // The raw bytes weren't staged, decode and save them for next time.
        self.metrics.miss_inc();
        let value = decode::<T>(key, &bytes)?;
        self.decoded.insert(digest, Arc::new(value.clone()));
        Ok(Some(value))
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.delete(key).await
    }

    pub async fn health_check(&self) -> Result<(), CacheError> {
        self.inner.health_check().await
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice(bytes).map_err(|e| CacheError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
