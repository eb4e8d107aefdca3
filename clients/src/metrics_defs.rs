//! Metrics definitions for the upstream clients and the metrics pipeline.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CONFIG_PAGE_FETCHES: MetricDef = MetricDef {
    name: "upstream.config.page_fetches",
    metric_type: MetricType::Counter,
    description: "Proxy config pages fetched from upstream, labelled by status",
};

pub const METRICS_UPLOADS: MetricDef = MetricDef {
    name: "upstream.metrics.uploads",
    metric_type: MetricType::Counter,
    description: "Metrics batches posted to the upstream metrics service, labelled by status",
};

pub const QUEUE_FLUSHES: MetricDef = MetricDef {
    name: "metrics_queue.flushes",
    metric_type: MetricType::Counter,
    description: "Flush ticks that emitted a non-empty metrics batch, labelled by buffer",
};

pub const QUEUE_DROPPED: MetricDef = MetricDef {
    name: "metrics_queue.dropped",
    metric_type: MetricType::Counter,
    description: "Metrics entries dropped because a sub-buffer exceeded its size cap",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CONFIG_PAGE_FETCHES,
    METRICS_UPLOADS,
    QUEUE_FLUSHES,
    QUEUE_DROPPED,
];
