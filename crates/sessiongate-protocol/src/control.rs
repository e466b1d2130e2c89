//! Control-plane request and response bodies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BackendDescriptor, Metadata};

/// `POST /create-session`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    pub backend: BackendDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub session_id: String,
    /// True when an existing session for the same composite key was returned.
    #[serde(default)]
    pub reused: bool,
}

/// `POST /register-server`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerRequest {
    pub server_name: String,
    pub backend: BackendDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerResponse {
    pub server_name: String,
    pub registered_at: DateTime<Utc>,
}

/// `GET /discover-server/{serverName}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverServerResponse {
    pub backend: BackendDescriptor,
    #[serde(default)]
    pub metadata: Metadata,
    pub registered_at: DateTime<Utc>,
}

/// `DELETE /register-server/{serverName}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveServerResponse {
    pub removed: bool,
}

/// `POST /revoke-session`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeSessionRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeSessionResponse {
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub draining: bool,
}

/// Aggregate registry counts for `GET /stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_sessions: u64,
    pub by_server: BTreeMap<String, u64>,
    pub by_user: BTreeMap<String, u64>,
    pub oldest_session: Option<DateTime<Utc>>,
    pub newest_session: Option<DateTime<Utc>>,
    pub registered_servers: u64,
}

/// Session listing entry. Never carries the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub server_name: String,
    pub server_type: String,
    pub backend: BackendDescriptor,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}
