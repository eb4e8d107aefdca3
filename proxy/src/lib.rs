//! The edge-facing proxy service: SDK authentication, cached config reads,
//! stream registration and metrics ingest, plus the config loader that keeps
//! the cache populated.

pub mod config_loader;
pub mod health;
pub mod offline;
pub mod service;
pub mod token;
pub mod transport;

pub use config_loader::{ConfigError, RemoteConfig, populate};
pub use health::ProxyHealth;
pub use service::{ProxyService, ServiceError};
pub use token::{Claims, TokenError, TokenSource};
pub use transport::EdgeService;
