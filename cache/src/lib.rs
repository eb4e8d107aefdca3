//! Shared key/value store abstraction and the memoize cache layered on top
//! of it.

pub mod keyval;
pub mod memoize;
pub mod memory;
pub mod metrics_defs;

pub use keyval::RedisCache;
pub use memoize::{MemoizeCache, MemoizeMetrics, NoOpMemoizeMetrics};
pub use memory::MemoryCache;

use async_trait::async_trait;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("failed encoding value for {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("failed decoding value for {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Raw byte-level key/value surface over the shared store. Typed reads and
/// writes go through [`MemoizeCache`], which layers decoding on top.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn health_check(&self) -> Result<(), CacheError>;
}
