//! Metrics definitions for the stream fabric.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SSE_CONNECTS: MetricDef = MetricDef {
    name: "stream.sse.connects",
    metric_type: MetricType::Counter,
    description: "Successful connections to the upstream SSE stream",
};

pub const SSE_DISCONNECTS: MetricDef = MetricDef {
    name: "stream.sse.disconnects",
    metric_type: MetricType::Counter,
    description: "Disconnects from the upstream SSE stream",
};

pub const FORWARDED_EVENTS: MetricDef = MetricDef {
    name: "stream.forwarder.published",
    metric_type: MetricType::Counter,
    description: "Events republished on an output transport by a forwarder",
};

pub const FORWARD_FAILURES: MetricDef = MetricDef {
    name: "stream.forwarder.publish_failures",
    metric_type: MetricType::Counter,
    description: "Events a forwarder failed to republish. The delegate handler still ran",
};

pub const REFRESHED_EVENTS: MetricDef = MetricDef {
    name: "stream.refresher.events",
    metric_type: MetricType::Counter,
    description: "Change events handled by the refresher, labelled by domain",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SSE_CONNECTS,
    SSE_DISCONNECTS,
    FORWARDED_EVENTS,
    FORWARD_FAILURES,
    REFRESHED_EVENTS,
];
