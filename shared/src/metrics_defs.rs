//! Common types for metrics definitions.
//!
//! Each crate declares its metrics as `MetricDef` consts in its own
//! `metrics_defs` module and collects them in an `ALL_METRICS` slice so the
//! binary can register descriptions with the recorder at startup.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

/// Registers the description of every metric in `defs` with the installed
/// recorder.
pub fn describe_all(defs: &[MetricDef]) {
    for def in defs {
        match def.metric_type {
            MetricType::Counter => {
                metrics::describe_counter!(def.name, def.description)
            }
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => {
                metrics::describe_histogram!(def.name, def.description)
            }
        }
    }
}
