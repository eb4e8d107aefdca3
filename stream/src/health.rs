use async_trait::async_trait;
use cache::{CacheError, MemoizeCache};
use domain::status::{StreamState, StreamStatus};
use parking_lot::RwLock;
use repository::keys;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Poll interval replicas use while the cached status is still initializing.
const REPLICA_STARTUP_POLL: Duration = Duration::from_secs(5);

/// Authoritative view of the upstream stream state. The Primary writes the
/// shared key, replicas mirror it in memory.
#[async_trait]
pub trait StreamHealth: Send + Sync {
    async fn set_healthy(&self) -> Result<(), CacheError>;
    async fn set_unhealthy(&self) -> Result<(), CacheError>;
    async fn status(&self) -> Result<StreamStatus, CacheError>;
}

/// Primary-side stream health: the sole writer of the shared status key
/// after startup. Keeps an in-memory copy so drift against the cache can be
/// detected and corrected.
pub struct PrimaryHealth {
    cache: MemoizeCache,
    state: Arc<RwLock<StreamStatus>>,
}

impl PrimaryHealth {
    /// Writes the INITIALIZING status that replicas poll for at startup.
    pub async fn new(cache: MemoizeCache) -> Result<Self, CacheError> {
        let status = StreamStatus::now(StreamState::Initializing);
        cache.set(keys::STREAM_HEALTH, &status).await?;
        Ok(PrimaryHealth {
            cache,
            state: Arc::new(RwLock::new(status)),
        })
    }

    async fn transition(&self, state: StreamState) -> Result<(), CacheError> {
        if self.state.read().state == state {
            return Ok(());
        }
        let status = StreamStatus::now(state);
        self.cache.set(keys::STREAM_HEALTH, &status).await?;
        *self.state.write() = status;
        tracing::info!(state = %state, "stream health transition");
        Ok(())
    }

    /// Periodically reconciles the cached status with the in-process one,
    /// rewriting the cache if the two drift apart.
    pub async fn verify_stream_status(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let in_memory = *self.state.read();
            match self.cache.get::<StreamStatus>(keys::STREAM_HEALTH).await {
                Ok(Some(cached)) if cached.state == in_memory.state => {}
                Ok(_) => {
                    tracing::warn!(
                        state = %in_memory.state,
                        "cached stream status drifted from in-memory status, correcting"
                    );
                    if let Err(e) = self.cache.set(keys::STREAM_HEALTH, &in_memory).await {
                        tracing::error!(error = %e, "failed to correct cached stream status");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to verify cached stream status");
                }
            }
        }
    }
}

#[async_trait]
impl StreamHealth for PrimaryHealth {
    async fn set_healthy(&self) -> Result<(), CacheError> {
        self.transition(StreamState::Connected).await
    }

    async fn set_unhealthy(&self) -> Result<(), CacheError> {
        self.transition(StreamState::Disconnected).await
    }

    async fn status(&self) -> Result<StreamStatus, CacheError> {
        Ok(*self.state.read())
    }
}

/// Replica-side stream health: an in-memory mirror. Replicas never write the
/// shared key; they snapshot it at startup and then follow control events.
#[derive(Default)]
pub struct ReplicaHealth {
    state: RwLock<StreamStatus>,
}

impl ReplicaHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Polls the cached status until it leaves INITIALIZING, then adopts it
    /// and returns. After this, control events keep the mirror current.
    pub async fn snapshot_cached_status(&self, cache: &MemoizeCache, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(REPLICA_STARTUP_POLL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let status = match cache.get::<StreamStatus>(keys::STREAM_HEALTH).await {
                Ok(Some(status)) => status,
                Ok(None) => {
                    tracing::info!("cached stream status missing, retrying");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to get cached stream status, retrying");
                    continue;
                }
            };

            if status.state == StreamState::Initializing {
                tracing::info!("cached stream status still initializing, retrying");
                continue;
            }

            *self.state.write() = status;
            tracing::info!(state = %status.state, since = status.since, "adopted cached stream status");
            return;
        }
    }
}

#[async_trait]
impl StreamHealth for ReplicaHealth {
    async fn set_healthy(&self) -> Result<(), CacheError> {
        *self.state.write() = StreamStatus::now(StreamState::Connected);
        Ok(())
    }

    async fn set_unhealthy(&self) -> Result<(), CacheError> {
        *self.state.write() = StreamStatus::now(StreamState::Disconnected);
        Ok(())
    }

    async fn status(&self) -> Result<StreamStatus, CacheError> {
        Ok(*self.state.read())
    }
}
