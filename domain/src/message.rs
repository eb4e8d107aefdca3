use crate::status::StreamState;
use serde::{Deserialize, Serialize};

/// Message domains carried on the upstream SSE stream and the internal bus.
pub mod msg_domain {
    pub const FLAG: &str = "flag";
    pub const TARGET_SEGMENT: &str = "target-segment";
    pub const PROXY: &str = "proxy";
}

/// Event types carried on the upstream SSE stream and the internal bus.
pub mod msg_event {
    pub const CREATE: &str = "create";
    pub const PATCH: &str = "patch";
    pub const DELETE: &str = "delete";
    pub const PROXY_KEY_DELETED: &str = "proxy-key-deleted";
    pub const ENVIRONMENT_ADDED: &str = "environment-added";
    pub const ENVIRONMENT_REMOVED: &str = "environment-removed";
    pub const API_KEY_ADDED: &str = "api-key-added";
    pub const API_KEY_REMOVED: &str = "api-key-removed";

    /// Control event the Primary publishes to replicas on stream state
    /// transitions. The new state travels in the message's domain field.
    pub const STREAM_ACTION: &str = "stream_action";
}

/// A change event, either received from the upstream SSE stream or published
/// on the internal bus. Both directions share this shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SseMessage {
    pub event: String,
    pub domain: String,
    pub identifier: String,
    pub version: u64,
    pub environments: Vec<String>,
    pub api_key: String,
}

impl SseMessage {
    /// Builds the control event announcing a stream state transition.
    pub fn stream_action(state: StreamState) -> Self {
        SseMessage {
            event: msg_event::STREAM_ACTION.to_string(),
            domain: state.to_string(),
            ..Default::default()
        }
    }

    /// Builds a delete notification for a config asset that disappeared from
    /// the upstream inventory.
    pub fn deleted(domain: &str, identifier: &str, environment: &str) -> Self {
        SseMessage {
            event: msg_event::DELETE.to_string(),
            domain: domain.to_string(),
            identifier: identifier.to_string(),
            environments: vec![environment.to_string()],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let msg = SseMessage {
            event: msg_event::PATCH.into(),
            domain: msg_domain::FLAG.into(),
            identifier: "dark-mode".into(),
            version: 2,
            environments: vec!["env-1".into()],
            api_key: String::new(),
        };

        let bytes = serde_json::to_vec(&msg).unwrap();
        let parsed: SseMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn stream_action_carries_state_in_domain() {
        let msg = SseMessage::stream_action(StreamState::Disconnected);
        assert_eq!(msg.event, msg_event::STREAM_ACTION);
        assert_eq!(msg.domain, "DISCONNECTED");
    }
}
