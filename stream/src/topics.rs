//! Named topics on the internal bus.

/// SSE events the Primary forwards for replicas to fan out to their SDKs.
pub const SSE_EVENTS: &str = "proxy:sse_events";

/// Stream-health control events the Primary sends to replicas.
pub const CONTROL_EVENTS: &str = "proxy:primary_to_replica_control_events";

/// Metrics replicas write through for the Primary's worker to drain.
pub const METRICS_EVENTS: &str = "proxy:metrics_events";
