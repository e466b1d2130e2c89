//! Token registry service.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use log::{debug, info, warn};
use sessiongate_protocol::{BackendDescriptor, Metadata, StatsResponse};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::error::RegistryError;
use super::models::{
    CompositeKey, EphemeralSession, MAX_TTL_MINUTES, NewSession, RegisteredServer, expiry_after,
};
use super::store::RegistryStore;
use crate::auth::{InvalidReason, SessionClaims, TokenIssuer, TokenKind, redact};

type Result<T> = std::result::Result<T, RegistryError>;

/// Window of the per-user creation cap.
const CREATION_WINDOW_MINUTES: i64 = 60;

/// Registry settings that do not belong to the store.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub default_ttl_minutes: i64,
    /// 0 disables the cap.
    pub max_sessions_per_user_per_hour: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_ttl_minutes: 60,
            max_sessions_per_user_per_hour: 0,
        }
    }
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_sessions: u64,
    pub stale_servers: u64,
}

/// Sessions and registered servers on top of a [`RegistryStore`].
#[derive(Clone)]
pub struct TokenRegistry {
    store: Arc<dyn RegistryStore>,
    issuer: TokenIssuer,
    settings: RegistrySettings,
    /// Serializes find-before-create within this process.
    create_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRegistry")
            .field("issuer", &self.issuer)
            .field("settings", &self.settings)
            .finish()
    }
}

impl TokenRegistry {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        issuer: TokenIssuer,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            store,
            issuer,
            settings,
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// Create a session, returning the live one for the same composite key
    /// when it exists.
    pub async fn create_session(&self, new: NewSession) -> Result<EphemeralSession> {
        self.find_or_create_session(new)
            .await
            .map(|(session, _)| session)
    }

    /// Like [`create_session`](Self::create_session), also reporting whether
    /// an existing session was reused.
    pub async fn find_or_create_session(
        &self,
        new: NewSession,
    ) -> Result<(EphemeralSession, bool)> {
        validate_new_session(&new)?;
        let key = new.key();

        let _guard = self.create_lock.lock().await;

        if let Some(existing) = self.store.find_latest_session(&key, Utc::now()).await? {
            debug!(
                "Reusing session {} for {}",
                existing.session_id, key
            );
            return Ok((existing, true));
        }

        let session = self.insert_new_session(new, key).await?;
        Ok((session, false))
    }

    async fn insert_new_session(
        &self,
        new: NewSession,
        key: CompositeKey,
    ) -> Result<EphemeralSession> {
        let now = Utc::now();
        let limit = self.settings.max_sessions_per_user_per_hour;
        if limit > 0 {
            let since = now - Duration::minutes(CREATION_WINDOW_MINUTES);
            let created = self.store.count_creations_since(&key.user_id, since).await?;
            if created >= u64::from(limit) {
                warn!(
                    "Session creation cap reached for user {} ({} in the last hour)",
                    key.user_id, created
                );
                return Err(RegistryError::RateLimited {
                    user_id: key.user_id,
                    limit,
                });
            }
        }

        let ttl = new.ttl_minutes.unwrap_or(self.settings.default_ttl_minutes);
        let expires_at = expiry_after(now, ttl).ok_or_else(|| {
            RegistryError::invalid(format!(
                "ttlMinutes must be between 1 and {}, got {}",
                MAX_TTL_MINUTES, ttl
            ))
        })?;
        let session_id = uuid::Uuid::new_v4().to_string();

        let claims = SessionClaims::new(
            &key.user_id,
            &key.server_name,
            &session_id,
            now.timestamp(),
            expires_at.timestamp(),
        );
        let token = self.issuer.issue(&claims)?;

        let session = EphemeralSession {
            token,
            session_id,
            user_id: key.user_id,
            server_name: key.server_name,
            server_type: key.server_type,
            backend: new.backend,
            created_at: now,
            expires_at,
            last_accessed_at: now,
            scopes: new.scopes,
            metadata: new.metadata,
        };

        self.store.insert_session(&session).await?;
        self.store.record_creation(&session.user_id, now).await?;

        info!(
            "Created session {} for {}/{} -> {} (token {}, ttl {}min)",
            session.session_id,
            session.user_id,
            session.server_name,
            session.backend,
            redact(&session.token),
            ttl
        );

        Ok(session)
    }

    /// Validate a token and return the rejection reason on failure.
    ///
    /// The reason is for logs only. HTTP callers must answer identically for
    /// every reason.
    pub async fn inspect_token(
        &self,
        token: &str,
    ) -> Result<std::result::Result<EphemeralSession, InvalidReason>> {
        if token.is_empty() {
            return Ok(Err(InvalidReason::NotFound));
        }

        let Some(mut session) = self.store.get_session(token).await? else {
            return Ok(Err(InvalidReason::NotFound));
        };

        let now = Utc::now();
        if session.is_expired_at(now) {
            self.store.delete_session(token).await?;
            return Ok(Err(InvalidReason::Expired));
        }

        if TokenKind::sniff(token) == TokenKind::Signed {
            match self.issuer.verify(token) {
                Ok(claims) if claims.sid == session.session_id && claims.sub == session.user_id => {}
                Ok(_) => return Ok(Err(InvalidReason::BadSignature)),
                Err(reason) => return Ok(Err(reason)),
            }
        }

        self.store.touch_session(token, now).await?;
        session.last_accessed_at = now;
        Ok(Ok(session))
    }

    /// Validate a token. `None` for every kind of rejection.
    pub async fn validate_token(&self, token: &str) -> Result<Option<EphemeralSession>> {
        match self.inspect_token(token).await? {
            Ok(session) => Ok(Some(session)),
            Err(reason) => {
                warn!("Rejected token {}: {}", redact(token), reason);
                Ok(None)
            }
        }
    }

    /// Push `expires_at` forward. False on an invalid token.
    pub async fn extend_session(&self, token: &str, minutes: i64) -> Result<bool> {
        if !(1..=MAX_TTL_MINUTES).contains(&minutes) {
            return Err(RegistryError::invalid(format!(
                "extension must be between 1 and {} minutes, got {}",
                MAX_TTL_MINUTES, minutes
            )));
        }

        let Some(session) = self.validate_token(token).await? else {
            return Ok(false);
        };

        let expires_at = expiry_after(session.expires_at, minutes)
            .ok_or_else(|| RegistryError::invalid("extended expiry is out of range"))?;
        let extended = self
            .store
            .set_session_expiry(token, expires_at, Utc::now())
            .await?;
        if extended {
            info!(
                "Extended session {} by {}min (now expires {})",
                session.session_id, minutes, expires_at
            );
        }
        Ok(extended)
    }

    pub async fn revoke_session(&self, token: &str) -> Result<bool> {
        let revoked = self.store.delete_session(token).await?;
        if revoked {
            info!("Revoked session token {}", redact(token));
        }
        Ok(revoked)
    }

    pub async fn revoke_user_sessions(&self, user_id: &str) -> Result<u64> {
        let count = self.store.delete_user_sessions(user_id).await?;
        if count > 0 {
            info!("Revoked {} session(s) for user {}", count, user_id);
        }
        Ok(count)
    }

    /// Most recent live session for the composite key.
    pub async fn find_active_session(
        &self,
        user_id: &str,
        server_name: &str,
        server_type: Option<&str>,
    ) -> Result<Option<EphemeralSession>> {
        let key = CompositeKey::new(user_id, server_name, server_type);
        Ok(self.store.find_latest_session(&key, Utc::now()).await?)
    }

    pub async fn get_user_sessions(&self, user_id: &str) -> Result<Vec<EphemeralSession>> {
        Ok(self.store.list_user_sessions(user_id, Utc::now()).await?)
    }

    pub async fn get_stats(&self) -> Result<StatsResponse> {
        let sessions = self.store.list_sessions(Utc::now()).await?;
        let mut stats = StatsResponse {
            registered_servers: self.store.count_servers().await?,
            ..StatsResponse::default()
        };

        for session in &sessions {
            stats.total_sessions += 1;
            *stats
                .by_server
                .entry(session.server_name.clone())
                .or_default() += 1;
            *stats.by_user.entry(session.user_id.clone()).or_default() += 1;
            stats.oldest_session = Some(match stats.oldest_session {
                Some(t) => t.min(session.created_at),
                None => session.created_at,
            });
            stats.newest_session = Some(match stats.newest_session {
                Some(t) => t.max(session.created_at),
                None => session.created_at,
            });
        }

        Ok(stats)
    }

    /// Upsert a server under its logical name.
    pub async fn register_server(
        &self,
        server_name: &str,
        backend: BackendDescriptor,
        metadata: Option<Metadata>,
    ) -> Result<RegisteredServer> {
        if server_name.trim().is_empty() {
            return Err(RegistryError::invalid("serverName must not be empty"));
        }

        let now = Utc::now();
        let server = RegisteredServer {
            server_name: server_name.to_string(),
            backend,
            registered_at: now,
            last_heartbeat: now,
            metadata: metadata.unwrap_or_default(),
        };
        self.store.upsert_server(&server).await?;

        info!("Registered server {} at {}", server.server_name, server.backend);
        Ok(server)
    }

    pub async fn get_registered_server(&self, server_name: &str) -> Result<Option<RegisteredServer>> {
        Ok(self.store.get_server(server_name).await?)
    }

    /// False when the server is not registered.
    pub async fn update_server_heartbeat(&self, server_name: &str) -> Result<bool> {
        Ok(self.store.touch_server(server_name, Utc::now()).await?)
    }

    pub async fn unregister_server(&self, server_name: &str) -> Result<bool> {
        let removed = self.store.delete_server(server_name).await?;
        if removed {
            info!("Unregistered server {}", server_name);
        }
        Ok(removed)
    }

    /// Remove servers without a heartbeat in the last `threshold_minutes`.
    pub async fn cleanup_stale_servers(&self, threshold_minutes: i64) -> Result<u64> {
        let cutoff = Duration::try_minutes(threshold_minutes)
            .and_then(|delta| Utc::now().checked_sub_signed(delta))
            .ok_or_else(|| {
                RegistryError::invalid(format!("stale threshold out of range: {}min", threshold_minutes))
            })?;
        let count = self.store.delete_stale_servers(cutoff).await?;
        if count > 0 {
            info!(
                "Removed {} stale server registration(s) (no heartbeat for {}min)",
                count, threshold_minutes
            );
        }
        Ok(count)
    }

    /// Remove expired sessions and creation-log entries outside the cap window.
    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let now = Utc::now();
        let count = self.store.delete_expired_sessions(now).await?;
        self.store
            .prune_creations(now - Duration::minutes(CREATION_WINDOW_MINUTES))
            .await?;
        if count > 0 {
            info!("Removed {} expired session(s)", count);
        }
        Ok(count)
    }

    pub async fn sweep(&self, stale_server_minutes: i64) -> Result<SweepReport> {
        Ok(SweepReport {
            expired_sessions: self.cleanup_expired_sessions().await?,
            stale_servers: self.cleanup_stale_servers(stale_server_minutes).await?,
        })
    }

    /// Run [`sweep`](Self::sweep) on an interval until the handle is aborted.
    pub fn start_sweep_task(
        &self,
        interval_secs: u64,
        stale_server_minutes: i64,
    ) -> JoinHandle<()> {
        info!(
            "Starting registry sweep task (every {}s, stale after {}min)",
            interval_secs, stale_server_minutes
        );

        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(StdDuration::from_secs(interval_secs.max(1)));

            loop {
                interval.tick().await;

                if let Err(e) = registry.sweep(stale_server_minutes).await {
                    warn!("Registry sweep failed: {:?}", e);
                }
            }
        })
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn validate_new_session(new: &NewSession) -> Result<()> {
    if new.user_id.trim().is_empty() {
        return Err(RegistryError::invalid("userId must not be empty"));
    }
    if new.server_name.trim().is_empty() {
        return Err(RegistryError::invalid("serverName must not be empty"));
    }
    if let Some(ttl) = new.ttl_minutes
        && !(1..=MAX_TTL_MINUTES).contains(&ttl)
    {
        return Err(RegistryError::invalid(format!(
            "ttlMinutes must be between 1 and {}, got {}",
            MAX_TTL_MINUTES, ttl
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistryStore;

    const SECRET: &str = "registry-test-secret-with-32-plus-chars";

    fn registry_with(issuer: TokenIssuer, settings: RegistrySettings) -> TokenRegistry {
        TokenRegistry::new(Arc::new(MemoryRegistryStore::new()), issuer, settings)
    }

    fn registry() -> TokenRegistry {
        registry_with(TokenIssuer::signed(SECRET), RegistrySettings::default())
    }

    fn todo_session(user: &str) -> NewSession {
        NewSession::new(user, "todo", BackendDescriptor::tcp("127.0.0.1", 8600))
    }

    #[tokio::test]
    async fn created_session_validates() {
        let registry = registry();
        let session = registry.create_session(todo_session("u1")).await.unwrap();

        let validated = registry.validate_token(&session.token).await.unwrap().unwrap();
        assert_eq!(validated.user_id, "u1");
        assert_eq!(validated.server_name, "todo");
        assert_eq!(validated.server_type, "default");
    }

    #[tokio::test]
    async fn opaque_and_signed_tokens_coexist() {
        let store: Arc<dyn RegistryStore> = Arc::new(MemoryRegistryStore::new());
        let signed = TokenRegistry::new(
            store.clone(),
            TokenIssuer::signed(SECRET),
            RegistrySettings::default(),
        );
        let opaque = TokenRegistry::new(store, TokenIssuer::opaque(), RegistrySettings::default());

        let a = opaque.create_session(todo_session("u1")).await.unwrap();
        assert_eq!(TokenKind::sniff(&a.token), TokenKind::Opaque);
        // The signing registry accepts opaque tokens from the shared store.
        assert!(signed.validate_token(&a.token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_token_is_invalid_and_deleted() {
        let registry = registry();
        let session = registry.create_session(todo_session("u1")).await.unwrap();
        let mut expired = session.clone();
        expired.token = "expired-token".to_string();
        expired.expires_at = Utc::now() - Duration::seconds(1);
        registry.store.insert_session(&expired).await.unwrap();

        assert_eq!(
            registry.inspect_token("expired-token").await.unwrap().unwrap_err(),
            InvalidReason::Expired
        );
        // Second call sees the record gone.
        assert_eq!(
            registry.inspect_token("expired-token").await.unwrap().unwrap_err(),
            InvalidReason::NotFound
        );
        assert!(registry.validate_token("expired-token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signed_token_from_other_secret_is_bad_signature() {
        let store: Arc<dyn RegistryStore> = Arc::new(MemoryRegistryStore::new());
        let minting = TokenRegistry::new(
            store.clone(),
            TokenIssuer::signed("some-other-secret-that-is-32-chars-long"),
            RegistrySettings::default(),
        );
        let checking =
            TokenRegistry::new(store, TokenIssuer::signed(SECRET), RegistrySettings::default());

        let session = minting.create_session(todo_session("u1")).await.unwrap();
        assert_eq!(
            checking.inspect_token(&session.token).await.unwrap().unwrap_err(),
            InvalidReason::BadSignature
        );
    }

    #[tokio::test]
    async fn extend_increases_expiry() {
        let registry = registry();
        let session = registry.create_session(todo_session("u1")).await.unwrap();

        assert!(registry.extend_session(&session.token, 30).await.unwrap());
        let after = registry.validate_token(&session.token).await.unwrap().unwrap();
        assert!(after.expires_at > session.expires_at);
        assert_eq!(after.expires_at, session.expires_at + Duration::minutes(30));
    }

    #[tokio::test]
    async fn extend_out_of_range_is_invalid_request() {
        let registry = registry();
        let session = registry.create_session(todo_session("u1")).await.unwrap();

        for minutes in [0, MAX_TTL_MINUTES + 1, i64::MAX / 100, i64::MAX] {
            assert!(matches!(
                registry.extend_session(&session.token, minutes).await,
                Err(RegistryError::InvalidRequest(_))
            ));
        }
        let after = registry.validate_token(&session.token).await.unwrap().unwrap();
        assert_eq!(after.expires_at, session.expires_at);
    }

    #[tokio::test]
    async fn extend_unknown_token_returns_false() {
        let registry = registry();
        assert!(!registry.extend_session("nope", 30).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_creates_share_one_record() {
        let registry = registry();
        let (a, b) = tokio::join!(
            registry.find_or_create_session(todo_session("u1")),
            registry.find_or_create_session(todo_session("u1")),
        );
        let (a, a_reused) = a.unwrap();
        let (b, b_reused) = b.unwrap();

        assert_eq!(a.token, b.token);
        assert!(a_reused != b_reused);
        assert_eq!(registry.get_user_sessions("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn server_type_separates_composite_keys() {
        let registry = registry();
        let a = registry.create_session(todo_session("u1")).await.unwrap();
        let b = registry
            .create_session(todo_session("u1").with_server_type("preview"))
            .await
            .unwrap();
        assert_ne!(a.token, b.token);

        let found = registry
            .find_active_session("u1", "todo", Some("preview"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.token, b.token);
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let registry = registry();
        let session = registry.create_session(todo_session("u1")).await.unwrap();

        assert!(registry.revoke_session(&session.token).await.unwrap());
        assert!(!registry.revoke_session(&session.token).await.unwrap());
        assert!(registry.validate_token(&session.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoke_user_sessions_counts() {
        let registry = registry();
        registry.create_session(todo_session("u1")).await.unwrap();
        registry
            .create_session(NewSession::new("u1", "notes", BackendDescriptor::Gateway {}))
            .await
            .unwrap();
        registry.create_session(todo_session("u2")).await.unwrap();

        assert_eq!(registry.revoke_user_sessions("u1").await.unwrap(), 2);
        assert_eq!(registry.get_stats().await.unwrap().total_sessions, 1);
    }

    #[tokio::test]
    async fn creation_cap_counts_revoked_sessions() {
        let registry = registry_with(
            TokenIssuer::opaque(),
            RegistrySettings {
                max_sessions_per_user_per_hour: 1,
                ..RegistrySettings::default()
            },
        );
        let session = registry.create_session(todo_session("u1")).await.unwrap();
        registry.revoke_session(&session.token).await.unwrap();

        let err = registry.create_session(todo_session("u1")).await.unwrap_err();
        assert!(matches!(err, RegistryError::RateLimited { limit: 1, .. }));
        // Other users are unaffected.
        registry.create_session(todo_session("u2")).await.unwrap();
    }

    #[tokio::test]
    async fn reuse_does_not_count_against_cap() {
        let registry = registry_with(
            TokenIssuer::opaque(),
            RegistrySettings {
                max_sessions_per_user_per_hour: 1,
                ..RegistrySettings::default()
            },
        );
        let first = registry.create_session(todo_session("u1")).await.unwrap();
        let again = registry.create_session(todo_session("u1")).await.unwrap();
        assert_eq!(first.token, again.token);
    }

    #[tokio::test]
    async fn rejects_empty_identity_and_bad_ttl() {
        let registry = registry();
        assert!(matches!(
            registry.create_session(todo_session("")).await,
            Err(RegistryError::InvalidRequest(_))
        ));
        assert!(matches!(
            registry
                .create_session(todo_session("u1").with_ttl_minutes(0))
                .await,
            Err(RegistryError::InvalidRequest(_))
        ));
        assert!(matches!(
            registry
                .create_session(todo_session("u1").with_ttl_minutes(9_000_000_000_000_000))
                .await,
            Err(RegistryError::InvalidRequest(_))
        ));
        assert!(matches!(
            registry.cleanup_stale_servers(i64::MAX).await,
            Err(RegistryError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn stats_group_by_server_and_user() {
        let registry = registry();
        registry.create_session(todo_session("u1")).await.unwrap();
        registry.create_session(todo_session("u2")).await.unwrap();
        registry
            .register_server("todo", BackendDescriptor::tcp("127.0.0.1", 8600), None)
            .await
            .unwrap();

        let stats = registry.get_stats().await.unwrap();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.by_server["todo"], 2);
        assert_eq!(stats.by_user["u1"], 1);
        assert_eq!(stats.registered_servers, 1);
        assert!(stats.oldest_session <= stats.newest_session);
    }

    #[tokio::test]
    async fn server_registration_lifecycle() {
        let registry = registry();
        registry
            .register_server("todo", BackendDescriptor::tcp("10.0.0.5", 8600), None)
            .await
            .unwrap();

        assert!(registry.update_server_heartbeat("todo").await.unwrap());
        assert!(!registry.update_server_heartbeat("missing").await.unwrap());
        assert_eq!(
            registry
                .get_registered_server("todo")
                .await
                .unwrap()
                .unwrap()
                .backend
                .port(),
            Some(8600)
        );

        // Fresh heartbeat survives a 30 minute threshold.
        assert_eq!(registry.cleanup_stale_servers(30).await.unwrap(), 0);
        assert!(registry.unregister_server("todo").await.unwrap());
        assert!(!registry.unregister_server("todo").await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_expired() {
        let registry = registry();
        let session = registry.create_session(todo_session("u1")).await.unwrap();
        let mut expired = session.clone();
        expired.token = "gone".to_string();
        expired.expires_at = Utc::now() - Duration::minutes(1);
        registry.store.insert_session(&expired).await.unwrap();

        let report = registry.sweep(30).await.unwrap();
        assert_eq!(report.expired_sessions, 1);
        assert!(registry.validate_token(&session.token).await.unwrap().is_some());
    }
}
