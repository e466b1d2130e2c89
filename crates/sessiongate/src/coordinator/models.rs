//! Coordinator request and descriptor types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sessiongate_protocol::{BackendDescriptor, CreateSessionRequest, Metadata};

use super::mode::RoutingMode;
use crate::registry::{CompositeKey, MAX_TTL_MINUTES, NewSession};

/// A caller asking for a session slot.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user_id: String,
    pub server_name: String,
    pub server_type: Option<String>,
    pub ttl_minutes: Option<i64>,
    pub metadata: Metadata,
}

impl SessionRequest {
    pub fn new(user_id: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            server_name: server_name.into(),
            server_type: None,
            ttl_minutes: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_server_type(mut self, server_type: impl Into<String>) -> Self {
        self.server_type = Some(server_type.into());
        self
    }

    pub fn with_ttl_minutes(mut self, minutes: i64) -> Self {
        self.ttl_minutes = Some(minutes);
        self
    }

    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(
            &self.user_id,
            &self.server_name,
            self.server_type.as_deref(),
        )
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("userId must not be empty".to_string());
        }
        if self.server_name.trim().is_empty() {
            return Err("serverName must not be empty".to_string());
        }
        if let Some(ttl) = self.ttl_minutes
            && !(1..=MAX_TTL_MINUTES).contains(&ttl)
        {
            return Err(format!(
                "ttlMinutes must be between 1 and {}, got {}",
                MAX_TTL_MINUTES, ttl
            ));
        }
        Ok(())
    }

    pub(crate) fn to_create_request(&self, backend: BackendDescriptor) -> CreateSessionRequest {
        CreateSessionRequest {
            user_id: self.user_id.clone(),
            server_name: self.server_name.clone(),
            server_type: self.server_type.clone(),
            backend,
            ttl_minutes: self.ttl_minutes,
            scopes: Vec::new(),
            metadata: self.metadata.clone(),
        }
    }

    pub(crate) fn to_new_session(&self, backend: BackendDescriptor) -> NewSession {
        NewSession {
            user_id: self.user_id.clone(),
            server_name: self.server_name.clone(),
            server_type: self.server_type.clone(),
            backend,
            ttl_minutes: self.ttl_minutes,
            scopes: Vec::new(),
            metadata: self.metadata.clone(),
        }
    }
}

/// A fully resolved session: the URL to hand out and where to serve it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub mode: RoutingMode,
    pub token: String,
    pub session_id: String,
    pub user_id: String,
    pub server_name: String,
    pub url: String,
    pub backend: BackendDescriptor,
    /// Port this process must bind. `None` when the backend is served
    /// elsewhere.
    pub port: Option<u16>,
    pub expires_at: DateTime<Utc>,
    /// Returned from this process's active set without new allocation.
    pub reused: bool,
    /// Backend came from an existing registration; nothing to bind.
    pub discovered: bool,
}

impl SessionDescriptor {
    pub fn needs_bind(&self) -> bool {
        !self.reused && !self.discovered && self.port.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
