//! Storage seam for the registry.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{CompositeKey, EphemeralSession, RegisteredServer};

/// Durable session and server storage.
///
/// Implementations are shared across tasks. Every call is an independent
/// per-record operation; no method needs to be atomic with another.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn insert_session(&self, session: &EphemeralSession) -> Result<()>;

    /// Fetch by token, expired records included.
    async fn get_session(&self, token: &str) -> Result<Option<EphemeralSession>>;

    async fn delete_session(&self, token: &str) -> Result<bool>;

    async fn delete_user_sessions(&self, user_id: &str) -> Result<u64>;

    async fn touch_session(&self, token: &str, at: DateTime<Utc>) -> Result<()>;

    /// Move `expires_at` and `last_accessed_at`. False when the token is gone.
    async fn set_session_expiry(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        accessed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Most recently created session for `key` that is live at `now`.
    async fn find_latest_session(
        &self,
        key: &CompositeKey,
        now: DateTime<Utc>,
    ) -> Result<Option<EphemeralSession>>;

    /// Live sessions for a user, newest first.
    async fn list_user_sessions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EphemeralSession>>;

    /// Every live session.
    async fn list_sessions(&self, now: DateTime<Utc>) -> Result<Vec<EphemeralSession>>;

    /// Remove sessions with `expires_at <= now`.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Insert or replace by server name.
    async fn upsert_server(&self, server: &RegisteredServer) -> Result<()>;

    async fn get_server(&self, server_name: &str) -> Result<Option<RegisteredServer>>;

    async fn touch_server(&self, server_name: &str, at: DateTime<Utc>) -> Result<bool>;

    async fn delete_server(&self, server_name: &str) -> Result<bool>;

    /// Remove servers whose last heartbeat is before `cutoff`.
    async fn delete_stale_servers(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn count_servers(&self) -> Result<u64>;

    async fn record_creation(&self, user_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn count_creations_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64>;

    async fn prune_creations(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Release underlying connections.
    async fn close(&self);
}
