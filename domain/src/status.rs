use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// The state of the upstream SSE connection, shared through the cache under a
/// well-known key. The Primary is the sole writer after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    #[serde(rename = "INITIALIZING")]
    Initializing,
    #[serde(rename = "CONNECTED")]
    Connected,
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Initializing => "INITIALIZING",
            StreamState::Connected => "CONNECTED",
            StreamState::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub state: StreamState,
    pub since: i64,
}

impl StreamStatus {
    pub fn now(state: StreamState) -> Self {
        StreamStatus {
            state,
            since: unix_now(),
        }
    }
}

impl Default for StreamStatus {
    fn default() -> Self {
        StreamStatus {
            state: StreamState::Initializing,
            since: 0,
        }
    }
}

/// Whether the startup config sync succeeded, reported from the health
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigState {
    #[serde(rename = "SYNCED")]
    Synced,
    #[serde(rename = "FAILED_TO_SYNC")]
    FailedToSync,
    #[serde(rename = "READ_REPLICA")]
    ReadReplica,
}

impl fmt::Display for ConfigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigState::Synced => "SYNCED",
            ConfigState::FailedToSync => "FAILED_TO_SYNC",
            ConfigState::ReadReplica => "READ_REPLICA",
        };
        f.write_str(s)
    }
}

/// Seconds since the unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
