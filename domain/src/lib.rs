//! Core data model and trait seams shared by every relay component.

pub mod client;
pub mod message;
pub mod metrics;
pub mod model;
pub mod requests;
pub mod status;
pub mod stream;
pub mod sync;

pub use client::{ClientService, GetProxyConfigInput, ProxyKeyAuth, UpstreamError};
pub use message::SseMessage;
pub use metrics::{MetricStore, MetricsRequest};
pub use model::{AuthApiKey, AuthConfig, Environment, EnvironmentId, ProxyConfig};
pub use status::{ConfigState, StreamState, StreamStatus};
pub use stream::{DynError, MessageHandler, NoOpMessageHandler, Stream, StreamError};
pub use sync::{ConnectedStreams, GuardedValue, SharedCredentials};
