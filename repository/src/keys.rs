//! Deterministic cache key naming.
//!
//! The prefixes are part of the external contract: offline config exports
//! and replica reads depend on them.

/// Key the upstream stream status is shared under.
pub const STREAM_HEALTH: &str = "ffproxy_saas_stream_health";

/// Key the config asset inventory is stored under.
pub const INVENTORY: &str = "proxy-config-inventory";

pub fn flags(env: &str) -> String {
    format!("env-{env}-flags")
}

pub fn segments(env: &str) -> String {
    format!("env-{env}-segments")
}

pub fn targets(env: &str) -> String {
    format!("env-{env}-targets")
}

pub fn api_keys(env: &str) -> String {
    format!("env-{env}-apikeys")
}
