//! In-process registry store for tests and embedded use.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::models::{CompositeKey, EphemeralSession, RegisteredServer};
use super::store::RegistryStore;

#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    sessions: DashMap<String, EphemeralSession>,
    servers: DashMap<String, RegisteredServer>,
    creations: DashMap<String, Vec<DateTime<Utc>>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, now: DateTime<Utc>, filter: impl Fn(&EphemeralSession) -> bool) -> Vec<EphemeralSession> {
        let mut sessions: Vec<EphemeralSession> = self
            .sessions
            .iter()
            .filter(|entry| !entry.is_expired_at(now) && filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn insert_session(&self, session: &EphemeralSession) -> Result<()> {
        if self.sessions.contains_key(&session.token) {
            anyhow::bail!("duplicate session token");
        }
        self.sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, token: &str) -> Result<Option<EphemeralSession>> {
        Ok(self.sessions.get(token).map(|s| s.value().clone()))
    }

    async fn delete_session(&self, token: &str) -> Result<bool> {
        Ok(self.sessions.remove(token).is_some())
    }

    async fn delete_user_sessions(&self, user_id: &str) -> Result<u64> {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - self.sessions.len()) as u64)
    }

    async fn touch_session(&self, token: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut session) = self.sessions.get_mut(token) {
            session.last_accessed_at = at;
        }
        Ok(())
    }

    async fn set_session_expiry(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        accessed_at: DateTime<Utc>,
    ) -> Result<bool> {
        match self.sessions.get_mut(token) {
            Some(mut session) => {
                session.expires_at = expires_at;
                session.last_accessed_at = accessed_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_latest_session(
        &self,
        key: &CompositeKey,
        now: DateTime<Utc>,
    ) -> Result<Option<EphemeralSession>> {
        Ok(self.live(now, |s| s.key() == *key).into_iter().next())
    }

    async fn list_user_sessions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EphemeralSession>> {
        Ok(self.live(now, |s| s.user_id == user_id))
    }

    async fn list_sessions(&self, now: DateTime<Utc>) -> Result<Vec<EphemeralSession>> {
        Ok(self.live(now, |_| true))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        Ok((before - self.sessions.len()) as u64)
    }

    async fn upsert_server(&self, server: &RegisteredServer) -> Result<()> {
        self.servers
            .insert(server.server_name.clone(), server.clone());
        Ok(())
    }

    async fn get_server(&self, server_name: &str) -> Result<Option<RegisteredServer>> {
        Ok(self.servers.get(server_name).map(|s| s.value().clone()))
    }

    async fn touch_server(&self, server_name: &str, at: DateTime<Utc>) -> Result<bool> {
        match self.servers.get_mut(server_name) {
            Some(mut server) => {
                server.last_heartbeat = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_server(&self, server_name: &str) -> Result<bool> {
        Ok(self.servers.remove(server_name).is_some())
    }

    async fn delete_stale_servers(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.servers.len();
        self.servers.retain(|_, s| s.last_heartbeat >= cutoff);
        Ok((before - self.servers.len()) as u64)
    }

    async fn count_servers(&self) -> Result<u64> {
        Ok(self.servers.len() as u64)
    }

    async fn record_creation(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.creations
            .entry(user_id.to_string())
            .or_default()
            .push(at);
        Ok(())
    }

    async fn count_creations_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .creations
            .get(user_id)
            .map(|log| log.iter().filter(|at| **at >= since).count() as u64)
            .unwrap_or(0))
    }

    async fn prune_creations(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut pruned = 0u64;
        for mut log in self.creations.iter_mut() {
            let len = log.len();
            log.retain(|at| *at >= before);
            pruned += (len - log.len()) as u64;
        }
        self.creations.retain(|_, log| !log.is_empty());
        Ok(pruned)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sessiongate_protocol::{BackendDescriptor, Metadata};

    fn session(token: &str, user: &str, expires_in: Duration) -> EphemeralSession {
        let now = Utc::now();
        EphemeralSession {
            token: token.to_string(),
            session_id: token.to_string(),
            user_id: user.to_string(),
            server_name: "todo".to_string(),
            server_type: "default".to_string(),
            backend: BackendDescriptor::tcp("127.0.0.1", 9000),
            created_at: now,
            expires_at: now + expires_in,
            last_accessed_at: now,
            scopes: vec![],
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_token_rejected() {
        let store = MemoryRegistryStore::new();
        let s = session("t", "u1", Duration::minutes(5));
        store.insert_session(&s).await.unwrap();
        assert!(store.insert_session(&s).await.is_err());
    }

    #[tokio::test]
    async fn revoke_user_counts_removed() {
        let store = MemoryRegistryStore::new();
        store.insert_session(&session("a", "u1", Duration::minutes(5))).await.unwrap();
        store.insert_session(&session("b", "u1", Duration::minutes(5))).await.unwrap();
        store.insert_session(&session("c", "u2", Duration::minutes(5))).await.unwrap();

        assert_eq!(store.delete_user_sessions("u1").await.unwrap(), 2);
        assert_eq!(store.delete_user_sessions("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn listings_hide_expired() {
        let store = MemoryRegistryStore::new();
        store.insert_session(&session("live", "u1", Duration::minutes(5))).await.unwrap();
        store.insert_session(&session("dead", "u1", Duration::minutes(-5))).await.unwrap();

        let now = Utc::now();
        let listed = store.list_user_sessions("u1", now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].token, "live");
        assert!(store.get_session("dead").await.unwrap().is_some());
        assert_eq!(store.delete_expired_sessions(now).await.unwrap(), 1);
    }
}
