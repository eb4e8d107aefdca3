//! Clients for the upstream SaaS plus the metrics aggregation pipeline.

pub mod client_service;
pub mod metrics_defs;
pub mod metrics_service;
pub mod queue;
pub mod stream_store;
pub mod worker;

pub use client_service::{HttpClientService, parse_account_id};
pub use metrics_service::MetricsService;
pub use queue::MetricsQueue;
pub use stream_store::MetricsStreamStore;
pub use worker::MetricsWorker;
