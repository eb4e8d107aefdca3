//! Request and response shapes the edge transport binds to HTTP.

use crate::model::Target;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fields sent in an authentication request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub api_key: String,
    #[serde(default)]
    pub target: Option<Target>,
}

/// Fields returned in an authentication response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub auth_token: String,
}

/// Fields returned in a healthcheck response.
pub type HealthResponse = HashMap<String, String>;

/// Fields returned by a stream registration request. The channel is the
/// identifier the push gateway holds the long-lived connection on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamResponse {
    pub grip_channel: String,
}
