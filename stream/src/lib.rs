//! The stream fabric: transports over the shared stream store, the upstream
//! SSE source and the push gateway, plus the forwarder pipeline, the backoff
//! subscribe wrapper, stream health and the cache refresher.

pub mod forwarder;
pub mod handlers;
pub mod health;
pub mod metrics_defs;
pub mod pushpin;
pub mod redis_stream;
pub mod refresher;
pub mod sse_client;
pub mod topics;
pub mod worker;

pub use forwarder::Forwarder;
pub use handlers::{ControlMessageHandler, ReplicaStreamDisconnect, SaasOnConnect, SaasOnDisconnect};
pub use health::{PrimaryHealth, ReplicaHealth, StreamHealth};
pub use pushpin::Pushpin;
pub use redis_stream::RedisStream;
pub use refresher::{RefreshError, Refresher};
pub use sse_client::SseClient;
pub use worker::{Hook, StreamWorker};

use async_trait::async_trait;
use domain::stream::StreamError;

/// Control surface for force-closing Proxy -> SDK stream channels. The push
/// gateway implements it; tests mock it.
#[async_trait]
pub trait ChannelCloser: Send + Sync {
    async fn close_channel(&self, channel: &str) -> Result<(), StreamError>;
}
