//! SQLite registry store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use super::models::{CompositeKey, EphemeralSession, RegisteredServer};
use super::store::RegistryStore;
use crate::db::Database;

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str = r#"
    token, session_id, user_id, server_name, server_type, backend,
    created_at, expires_at, last_accessed_at, scopes, metadata
"#;

const SERVER_COLUMNS: &str = r#"
    server_name, backend, registered_at, last_heartbeat, metadata
"#;

#[derive(Debug, FromRow)]
struct SessionRow {
    token: String,
    session_id: String,
    user_id: String,
    server_name: String,
    server_type: String,
    backend: String,
    created_at: i64,
    expires_at: i64,
    last_accessed_at: i64,
    scopes: String,
    metadata: String,
}

impl TryFrom<SessionRow> for EphemeralSession {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Self {
            backend: serde_json::from_str(&row.backend)
                .with_context(|| format!("decoding backend of session {}", row.session_id))?,
            scopes: serde_json::from_str(&row.scopes).context("decoding session scopes")?,
            metadata: serde_json::from_str(&row.metadata).context("decoding session metadata")?,
            created_at: from_millis(row.created_at)?,
            expires_at: from_millis(row.expires_at)?,
            last_accessed_at: from_millis(row.last_accessed_at)?,
            token: row.token,
            session_id: row.session_id,
            user_id: row.user_id,
            server_name: row.server_name,
            server_type: row.server_type,
        })
    }
}

#[derive(Debug, FromRow)]
struct ServerRow {
    server_name: String,
    backend: String,
    registered_at: i64,
    last_heartbeat: i64,
    metadata: String,
}

impl TryFrom<ServerRow> for RegisteredServer {
    type Error = anyhow::Error;

    fn try_from(row: ServerRow) -> Result<Self> {
        Ok(Self {
            backend: serde_json::from_str(&row.backend)
                .with_context(|| format!("decoding backend of server {}", row.server_name))?,
            metadata: serde_json::from_str(&row.metadata).context("decoding server metadata")?,
            registered_at: from_millis(row.registered_at)?,
            last_heartbeat: from_millis(row.last_heartbeat)?,
            server_name: row.server_name,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("timestamp out of range: {}", ms))
}

fn decode_sessions(rows: Vec<SessionRow>) -> Result<Vec<EphemeralSession>> {
    rows.into_iter().map(EphemeralSession::try_from).collect()
}

/// Registry store backed by SQLite. Every row is scoped by namespace.
#[derive(Debug, Clone)]
pub struct SqliteRegistryStore {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteRegistryStore {
    pub fn new(db: &Database, namespace: impl Into<String>) -> Self {
        Self {
            pool: db.pool().clone(),
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl RegistryStore for SqliteRegistryStore {
    async fn insert_session(&self, session: &EphemeralSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ephemeral_sessions (
                namespace, token, session_id, user_id, server_name, server_type, backend,
                created_at, expires_at, last_accessed_at, scopes, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.namespace)
        .bind(&session.token)
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(&session.server_name)
        .bind(&session.server_type)
        .bind(serde_json::to_string(&session.backend)?)
        .bind(session.created_at.timestamp_millis())
        .bind(session.expires_at.timestamp_millis())
        .bind(session.last_accessed_at.timestamp_millis())
        .bind(serde_json::to_string(&session.scopes)?)
        .bind(serde_json::to_string(&session.metadata)?)
        .execute(&self.pool)
        .await
        .context("inserting session")?;

        Ok(())
    }

    async fn get_session(&self, token: &str) -> Result<Option<EphemeralSession>> {
        let query = format!(
            "SELECT {} FROM ephemeral_sessions WHERE namespace = ? AND token = ?",
            SESSION_COLUMNS
        );
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(&self.namespace)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        row.map(EphemeralSession::try_from).transpose()
    }

    async fn delete_session(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ephemeral_sessions WHERE namespace = ? AND token = ?")
            .bind(&self.namespace)
            .bind(token)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_user_sessions(&self, user_id: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM ephemeral_sessions WHERE namespace = ? AND user_id = ?")
                .bind(&self.namespace)
                .bind(user_id)
                .execute(&self.pool)
                .await
                .context("deleting user sessions")?;

        Ok(result.rows_affected())
    }

    async fn touch_session(&self, token: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE ephemeral_sessions SET last_accessed_at = ? WHERE namespace = ? AND token = ?",
        )
        .bind(at.timestamp_millis())
        .bind(&self.namespace)
        .bind(token)
        .execute(&self.pool)
        .await
        .context("touching session")?;

        Ok(())
    }

    async fn set_session_expiry(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        accessed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ephemeral_sessions
            SET expires_at = ?, last_accessed_at = ?
            WHERE namespace = ? AND token = ?
            "#,
        )
        .bind(expires_at.timestamp_millis())
        .bind(accessed_at.timestamp_millis())
        .bind(&self.namespace)
        .bind(token)
        .execute(&self.pool)
        .await
        .context("extending session")?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_latest_session(
        &self,
        key: &CompositeKey,
        now: DateTime<Utc>,
    ) -> Result<Option<EphemeralSession>> {
        let query = format!(
            r#"
            SELECT {} FROM ephemeral_sessions
            WHERE namespace = ? AND user_id = ? AND server_name = ? AND server_type = ?
              AND expires_at > ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            SESSION_COLUMNS
        );
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(&self.namespace)
            .bind(&key.user_id)
            .bind(&key.server_name)
            .bind(&key.server_type)
            .bind(now.timestamp_millis())
            .fetch_optional(&self.pool)
            .await
            .context("finding active session")?;

        row.map(EphemeralSession::try_from).transpose()
    }

    async fn list_user_sessions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EphemeralSession>> {
        let query = format!(
            r#"
            SELECT {} FROM ephemeral_sessions
            WHERE namespace = ? AND user_id = ? AND expires_at > ?
            ORDER BY created_at DESC
            "#,
            SESSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(&self.namespace)
            .bind(user_id)
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await
            .context("listing sessions for user")?;

        decode_sessions(rows)
    }

    async fn list_sessions(&self, now: DateTime<Utc>) -> Result<Vec<EphemeralSession>> {
        let query = format!(
            r#"
            SELECT {} FROM ephemeral_sessions
            WHERE namespace = ? AND expires_at > ?
            ORDER BY created_at DESC
            "#,
            SESSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(&self.namespace)
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        decode_sessions(rows)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM ephemeral_sessions WHERE namespace = ? AND expires_at <= ?")
                .bind(&self.namespace)
                .bind(now.timestamp_millis())
                .execute(&self.pool)
                .await
                .context("deleting expired sessions")?;

        Ok(result.rows_affected())
    }

    async fn upsert_server(&self, server: &RegisteredServer) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO registered_servers (
                namespace, server_name, backend, registered_at, last_heartbeat, metadata
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, server_name) DO UPDATE SET
                backend = excluded.backend,
                registered_at = excluded.registered_at,
                last_heartbeat = excluded.last_heartbeat,
                metadata = excluded.metadata
            "#,
        )
        .bind(&self.namespace)
        .bind(&server.server_name)
        .bind(serde_json::to_string(&server.backend)?)
        .bind(server.registered_at.timestamp_millis())
        .bind(server.last_heartbeat.timestamp_millis())
        .bind(serde_json::to_string(&server.metadata)?)
        .execute(&self.pool)
        .await
        .context("registering server")?;

        Ok(())
    }

    async fn get_server(&self, server_name: &str) -> Result<Option<RegisteredServer>> {
        let query = format!(
            "SELECT {} FROM registered_servers WHERE namespace = ? AND server_name = ?",
            SERVER_COLUMNS
        );
        let row = sqlx::query_as::<_, ServerRow>(&query)
            .bind(&self.namespace)
            .bind(server_name)
            .fetch_optional(&self.pool)
            .await
            .context("fetching registered server")?;

        row.map(RegisteredServer::try_from).transpose()
    }

    async fn touch_server(&self, server_name: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE registered_servers SET last_heartbeat = ? WHERE namespace = ? AND server_name = ?",
        )
        .bind(at.timestamp_millis())
        .bind(&self.namespace)
        .bind(server_name)
        .execute(&self.pool)
        .await
        .context("updating server heartbeat")?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_server(&self, server_name: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM registered_servers WHERE namespace = ? AND server_name = ?")
                .bind(&self.namespace)
                .bind(server_name)
                .execute(&self.pool)
                .await
                .context("unregistering server")?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_stale_servers(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM registered_servers WHERE namespace = ? AND last_heartbeat < ?",
        )
        .bind(&self.namespace)
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("deleting stale servers")?;

        Ok(result.rows_affected())
    }

    async fn count_servers(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM registered_servers WHERE namespace = ?")
                .bind(&self.namespace)
                .fetch_one(&self.pool)
                .await
                .context("counting servers")?;

        Ok(count.max(0) as u64)
    }

    async fn record_creation(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_creations (namespace, user_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(&self.namespace)
        .bind(user_id)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("recording session creation")?;

        Ok(())
    }

    async fn count_creations_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM session_creations
            WHERE namespace = ? AND user_id = ? AND created_at >= ?
            "#,
        )
        .bind(&self.namespace)
        .bind(user_id)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .context("counting session creations")?;

        Ok(count.max(0) as u64)
    }

    async fn prune_creations(&self, before: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM session_creations WHERE namespace = ? AND created_at < ?")
                .bind(&self.namespace)
                .bind(before.timestamp_millis())
                .execute(&self.pool)
                .await
                .context("pruning creation log")?;

        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
