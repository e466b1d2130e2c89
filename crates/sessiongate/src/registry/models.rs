//! Registry data models.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sessiongate_protocol::{
    BackendDescriptor, CreateSessionRequest, DEFAULT_SERVER_TYPE, Metadata, SessionSummary,
};

/// Longest TTL or single extension accepted, in minutes (one year).
pub const MAX_TTL_MINUTES: i64 = 366 * 24 * 60;

/// `from` plus `minutes`, or `None` when `minutes` is outside
/// `1..=MAX_TTL_MINUTES` or the result is not representable.
pub fn expiry_after(from: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
    if !(1..=MAX_TTL_MINUTES).contains(&minutes) {
        return None;
    }
    Duration::try_minutes(minutes).and_then(|delta| from.checked_add_signed(delta))
}

/// A time-bounded grant of access to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralSession {
    pub token: String,
    pub session_id: String,
    pub user_id: String,
    pub server_name: String,
    pub server_type: String,
    pub backend: BackendDescriptor,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub metadata: Metadata,
}

impl EphemeralSession {
    /// Usable only while `now < expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(&self.user_id, &self.server_name, Some(&self.server_type))
    }

    /// Listing view without the token.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            server_name: self.server_name.clone(),
            server_type: self.server_type.clone(),
            backend: self.backend.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed_at: self.last_accessed_at,
        }
    }
}

/// `(userId, serverName, serverType)`: one logical session slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub user_id: String,
    pub server_name: String,
    pub server_type: String,
}

impl CompositeKey {
    pub fn new(user_id: &str, server_name: &str, server_type: Option<&str>) -> Self {
        Self {
            user_id: user_id.to_string(),
            server_name: server_name.to_string(),
            server_type: server_type.unwrap_or(DEFAULT_SERVER_TYPE).to_string(),
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.server_name, self.server_type)
    }
}

/// Input for [`TokenRegistry::create_session`](super::TokenRegistry::create_session).
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: String,
    pub server_name: String,
    pub server_type: Option<String>,
    pub backend: BackendDescriptor,
    /// Falls back to the configured default TTL.
    pub ttl_minutes: Option<i64>,
    pub scopes: Vec<String>,
    pub metadata: Metadata,
}

impl NewSession {
    pub fn new(
        user_id: impl Into<String>,
        server_name: impl Into<String>,
        backend: BackendDescriptor,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            server_name: server_name.into(),
            server_type: None,
            backend,
            ttl_minutes: None,
            scopes: Vec::new(),
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

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(
            &self.user_id,
            &self.server_name,
            self.server_type.as_deref(),
        )
    }
}

impl From<CreateSessionRequest> for NewSession {
    fn from(req: CreateSessionRequest) -> Self {
        Self {
            user_id: req.user_id,
            server_name: req.server_name,
            server_type: req.server_type,
            backend: req.backend,
            ttl_minutes: req.ttl_minutes,
            scopes: req.scopes,
            metadata: req.metadata,
        }
    }
}

/// A backend that announced itself under a logical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredServer {
    pub server_name: String,
    pub backend: BackendDescriptor,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: Metadata,
}

impl RegisteredServer {
    /// No heartbeat within `threshold` of `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.last_heartbeat < now - threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_at: DateTime<Utc>) -> EphemeralSession {
        let now = Utc::now();
        EphemeralSession {
            token: "tok".to_string(),
            session_id: "sid".to_string(),
            user_id: "u1".to_string(),
            server_name: "todo".to_string(),
            server_type: DEFAULT_SERVER_TYPE.to_string(),
            backend: BackendDescriptor::tcp("127.0.0.1", 8600),
            created_at: now,
            expires_at,
            last_accessed_at: now,
            scopes: vec![],
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let at = Utc::now();
        let s = session(at);
        assert!(s.is_expired_at(at));
        assert!(!s.is_expired_at(at - Duration::milliseconds(1)));
    }

    #[test]
    fn expiry_after_rejects_out_of_range_minutes() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 30), Some(now + Duration::minutes(30)));
        assert!(expiry_after(now, MAX_TTL_MINUTES).is_some());
        assert_eq!(expiry_after(now, 0), None);
        assert_eq!(expiry_after(now, MAX_TTL_MINUTES + 1), None);
        assert_eq!(expiry_after(now, 9_000_000_000_000_000), None);
        assert_eq!(expiry_after(now, i64::MAX), None);
        assert_eq!(expiry_after(DateTime::<Utc>::MAX_UTC, 1), None);
    }

    #[test]
    fn missing_server_type_uses_default() {
        let new = NewSession::new("u1", "todo", BackendDescriptor::Gateway {});
        assert_eq!(new.key(), CompositeKey::new("u1", "todo", Some("default")));
        assert_eq!(new.key().to_string(), "u1/todo/default");
    }

    #[test]
    fn summary_omits_token() {
        let s = session(Utc::now());
        let json = serde_json::to_value(s.summary()).unwrap();
        assert!(json.get("token").is_none());
        assert_eq!(json["serverName"], "todo");
    }
}
