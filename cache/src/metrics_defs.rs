//! Metrics definitions for the cache layer.

use shared::metrics_defs::{MetricDef, MetricType};

pub const MEMOIZE_HIT: MetricDef = MetricDef {
    name: "memoize_cache.hit",
    metric_type: MetricType::Counter,
    description: "Lookups that found the raw bytes in the memoize cache and skipped decoding",
};

pub const MEMOIZE_MISS: MetricDef = MetricDef {
    name: "memoize_cache.miss",
    metric_type: MetricType::Counter,
    description: "Lookups that missed the memoize cache and had to perform a full decode",
};

pub const MEMOIZE_WRITE_MARSHAL: MetricDef = MetricDef {
    name: "memoize_cache.write_marshal",
    metric_type: MetricType::Counter,
    description: "Objects encoded to bytes and staged in the memoize cache on write",
};

pub const MEMOIZE_HIT_WITH_UNMARSHAL: MetricDef = MetricDef {
    name: "memoize_cache.hit_with_unmarshal",
    metric_type: MetricType::Counter,
    description: "Lookups that hit the memoize cache but still had to decode. Indicates a caller \
                  reading a key back as a different type than it was written with",
};

pub const ALL_METRICS: &[MetricDef] = &[
    MEMOIZE_HIT,
    MEMOIZE_MISS,
    MEMOIZE_WRITE_MARSHAL,
    MEMOIZE_HIT_WITH_UNMARSHAL,
];
