//! Session coordinator.
//!
//! Owns the routing mode (resolved once), the strategy chain, the port
//! allocator and the set of sessions this process created.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::client::GatewayClient;
use super::error::{CoordinatorError, Result};
use super::host::resolve_external_host;
use super::mode::{ModeSignals, RoutingMode, select_mode};
use super::models::{SessionDescriptor, SessionRequest};
use super::ports::{BindError, DEFAULT_PORT_RANGE, PortAllocator, PortReservation};
use super::strategy::{
    AttemptContext, GatewayStrategy, LocalStrategy, RegistryStrategy, SessionStrategy,
    StrategyOutcome,
};
use crate::auth::redact;
use crate::registry::{CompositeKey, TokenRegistry};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Explicit mode; wins over environment signals.
    pub mode: Option<RoutingMode>,
    pub signals: ModeSignals,
    /// Gateway base URL browsers use. Defaults to the control-plane URL.
    pub public_url: Option<String>,
    pub prefix: String,
    /// Host a remote gateway dials back to.
    pub external_host: Option<String>,
    /// Host used in fully-local URLs.
    pub local_host: String,
    pub port_range: RangeInclusive<u16>,
    pub bind_host: IpAddr,
    pub default_ttl_minutes: i64,
    pub request_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mode: None,
            signals: ModeSignals::default(),
            public_url: None,
            prefix: "/s".to_string(),
            external_host: None,
            local_host: "localhost".to_string(),
            port_range: DEFAULT_PORT_RANGE,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            default_ttl_minutes: 60,
            request_timeout: Duration::from_secs(10),
        }
    }
}

struct ActiveSession {
    descriptor: SessionDescriptor,
    reservation: Option<PortReservation>,
    published: bool,
}

/// A started session and, when this process had to bind, the listener.
#[derive(Debug)]
pub struct StartedSession<L> {
    pub descriptor: SessionDescriptor,
    pub listener: Option<L>,
}

pub struct SessionCoordinator {
    mode: RoutingMode,
    strategies: Vec<Arc<dyn SessionStrategy>>,
    ports: PortAllocator,
    external_host: String,
    active: Mutex<HashMap<CompositeKey, ActiveSession>>,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("mode", &self.mode)
            .field("ports", &self.ports)
            .field("external_host", &self.external_host)
            .finish()
    }
}

impl SessionCoordinator {
    /// Resolve the mode and build its strategy chain:
    /// gateway -> registry (when injected) -> local, registry -> local, or
    /// local alone.
    pub fn new(config: CoordinatorConfig, registry: Option<TokenRegistry>) -> Result<Self> {
        let mode = select_mode(config.mode, &config.signals);
        let ports = PortAllocator::new(config.port_range.clone(), config.bind_host);
        let local: Arc<dyn SessionStrategy> = Arc::new(LocalStrategy::new(
            config.local_host.clone(),
            config.default_ttl_minutes,
        ));

        let external_host = match mode {
            RoutingMode::FullyLocal => config.local_host.clone(),
            _ => resolve_external_host(config.external_host.as_deref()),
        };

        let registry_link = |public_url: Option<&String>| -> Option<Arc<dyn SessionStrategy>> {
            let registry = registry.clone()?;
            let public_url = public_url?;
            Some(Arc::new(RegistryStrategy::new(
                registry,
                public_url.clone(),
                config.prefix.clone(),
            )))
        };

        let strategies = match mode {
            RoutingMode::GatewayRouted => {
                let gateway_url = config.signals.gateway_url.as_deref().ok_or_else(|| {
                    CoordinatorError::Config("gateway-routed mode needs a gateway URL".into())
                })?;
                let client = GatewayClient::new(gateway_url, config.request_timeout)
                    .map_err(|e| CoordinatorError::Config(format!("{:#}", e)))?;
                let public_url = config
                    .public_url
                    .clone()
                    .unwrap_or_else(|| gateway_url.to_string());

                let mut chain: Vec<Arc<dyn SessionStrategy>> = vec![Arc::new(
                    GatewayStrategy::new(client, public_url.clone(), config.prefix.clone()),
                )];
                chain.extend(registry_link(Some(&public_url)));
                chain.push(local);
                chain
            }
            RoutingMode::RegistryDirect => {
                if registry.is_none() {
                    return Err(CoordinatorError::Config(
                        "registry-direct mode needs a registry store".into(),
                    ));
                }
                let link = registry_link(config.public_url.as_ref()).ok_or_else(|| {
                    CoordinatorError::Config("registry-direct mode needs a public gateway URL".into())
                })?;
                vec![link, local]
            }
            RoutingMode::FullyLocal => vec![local],
        };

        info!(
            "Session coordinator in {} mode (advertising {})",
            mode, external_host
        );
        Ok(Self::with_strategies(mode, strategies, ports, external_host))
    }

    /// Coordinator over an explicit chain.
    pub fn with_strategies(
        mode: RoutingMode,
        strategies: Vec<Arc<dyn SessionStrategy>>,
        ports: PortAllocator,
        external_host: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            strategies,
            ports,
            external_host: external_host.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Return this process's live session for the composite key, or create
    /// one. The active set stays locked for the whole call, so concurrent
    /// requests for one key allocate once.
    pub async fn get_or_create(&self, request: SessionRequest) -> Result<SessionDescriptor> {
        request.validate().map_err(CoordinatorError::InvalidRequest)?;
        let key = request.key();

        let mut active = self.active.lock().await;

        if let Some(entry) = active.get(&key) {
            if !entry.descriptor.is_expired_at(Utc::now()) {
                debug!("Reusing session {} for {}", entry.descriptor.session_id, key);
                let mut descriptor = entry.descriptor.clone();
                descriptor.reused = true;
                return Ok(descriptor);
            }
            if let Some(expired) = active.remove(&key) {
                debug!("Session for {} expired; replacing", key);
                self.release_entry(expired).await;
            }
        }

        let outcome = self.run_chain(&request).await?;
        let descriptor = outcome.descriptor.clone();
        active.insert(
            key,
            ActiveSession {
                descriptor: outcome.descriptor,
                reservation: outcome.reservation,
                published: outcome.published,
            },
        );
        Ok(descriptor)
    }

    async fn run_chain(&self, request: &SessionRequest) -> Result<StrategyOutcome> {
        let ctx = AttemptContext::new(self.ports.clone(), self.external_host.clone());
        let mut last_error = None;

        for (i, strategy) in self.strategies.iter().enumerate() {
            match strategy.attempt(&ctx, request).await {
                Ok(outcome) => {
                    if i > 0 {
                        info!(
                            "Fell back to {} mode for {}/{} (releasing ports {:?} from failed attempts)",
                            strategy.mode(),
                            request.user_id,
                            request.server_name,
                            ctx.quarantined_ports()
                        );
                    }
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(
                        "{} strategy failed for {}/{}: {}",
                        strategy.mode(),
                        request.user_id,
                        request.server_name,
                        e
                    );
                    last_error = Some((strategy.mode(), e));
                }
            }
        }

        match last_error {
            Some((mode, source)) => Err(CoordinatorError::Exhausted { mode, source }),
            None => Err(CoordinatorError::Config("no session strategies configured".into())),
        }
    }

    /// Create or reuse a session and bind its port with `bind`.
    ///
    /// Reused and discovered sessions are not bound again. If the bind fails
    /// with "address in use", the session and its port are discarded and
    /// creation is retried once with the conflicting port still held.
    pub async fn start_session<L, F, Fut>(
        &self,
        request: SessionRequest,
        mut bind: F,
    ) -> Result<StartedSession<L>>
    where
        F: FnMut(SocketAddr) -> Fut,
        Fut: Future<Output = std::result::Result<L, BindError>>,
    {
        let descriptor = self.get_or_create(request.clone()).await?;
        let Some(port) = descriptor.port.filter(|_| descriptor.needs_bind()) else {
            return Ok(StartedSession {
                descriptor,
                listener: None,
            });
        };

        let conflict = match bind(SocketAddr::new(self.ports.bind_host(), port)).await {
            Ok(listener) => {
                return Ok(StartedSession {
                    descriptor,
                    listener: Some(listener),
                });
            }
            Err(e) if e.is_addr_in_use() => {
                warn!("Port {} in use at bind time; retrying once", port);
                self.discard(&descriptor).await
            }
            Err(e) => {
                self.discard(&descriptor).await;
                return Err(e.into());
            }
        };

        let descriptor = self.get_or_create(request).await?;
        let Some(retry_port) = descriptor.port.filter(|_| descriptor.needs_bind()) else {
            return Ok(StartedSession {
                descriptor,
                listener: None,
            });
        };

        let result = match bind(SocketAddr::new(self.ports.bind_host(), retry_port)).await {
            Ok(listener) => Ok(StartedSession {
                descriptor,
                listener: Some(listener),
            }),
            Err(e) => {
                self.discard(&descriptor).await;
                if e.is_addr_in_use() {
                    Err(CoordinatorError::PortConflict { port: retry_port })
                } else {
                    Err(e.into())
                }
            }
        };
        drop(conflict);
        result
    }

    /// Remove a session after a failed start, returning its reservation so
    /// the caller decides when the port goes back to the pool.
    async fn discard(&self, descriptor: &SessionDescriptor) -> Option<PortReservation> {
        let entry = {
            let mut active = self.active.lock().await;
            let key = active
                .iter()
                .find(|(_, entry)| entry.descriptor.token == descriptor.token)
                .map(|(key, _)| key.clone());
            key.and_then(|key| active.remove(&key))
        }?;
        self.unpublish(&entry).await;
        entry.reservation
    }

    /// Revoke a session this process created and release its port.
    pub async fn revoke_session(&self, token: &str) -> bool {
        let entry = {
            let mut active = self.active.lock().await;
            let key = active
                .iter()
                .find(|(_, entry)| entry.descriptor.token == token)
                .map(|(key, _)| key.clone());
            key.and_then(|key| active.remove(&key))
        };

        match entry {
            Some(entry) => {
                info!("Revoking session {}", redact(token));
                self.release_entry(entry).await;
                true
            }
            None => false,
        }
    }

    pub async fn find_session(&self, token: &str) -> Option<SessionDescriptor> {
        self.active
            .lock()
            .await
            .values()
            .find(|entry| entry.descriptor.token == token)
            .map(|entry| entry.descriptor.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    async fn unpublish(&self, entry: &ActiveSession) {
        if let Some(strategy) = self
            .strategies
            .iter()
            .find(|s| s.mode() == entry.descriptor.mode)
        {
            strategy.release(&entry.descriptor, entry.published).await;
        }
    }

    async fn release_entry(&self, entry: ActiveSession) {
        self.unpublish(&entry).await;
        if let Some(reservation) = entry.reservation {
            reservation.release();
        }
    }

    /// Revoke every session and release every port this coordinator holds.
    pub async fn close(&self) {
        let entries: Vec<ActiveSession> = {
            let mut active = self.active.lock().await;
            active.drain().map(|(_, entry)| entry).collect()
        };
        if !entries.is_empty() {
            info!("Closing {} coordinator session(s)", entries.len());
        }
        for entry in entries {
            self.release_entry(entry).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenIssuer;
    use crate::coordinator::error::StrategyError;
    use crate::coordinator::ports::bind_tcp;
    use crate::registry::{MemoryRegistryStore, RegistrySettings};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn registry() -> TokenRegistry {
        TokenRegistry::new(
            Arc::new(MemoryRegistryStore::new()),
            TokenIssuer::opaque(),
            RegistrySettings::default(),
        )
    }

    fn registry_config(range: RangeInclusive<u16>) -> CoordinatorConfig {
        CoordinatorConfig {
            mode: Some(RoutingMode::RegistryDirect),
            public_url: Some("http://gw:8080".to_string()),
            external_host: Some("127.0.0.1".to_string()),
            port_range: range,
            bind_host: localhost(),
            ..Default::default()
        }
    }

    /// Reserves a port, then fails like an unreachable gateway.
    struct FailingRemote {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionStrategy for FailingRemote {
        fn mode(&self) -> RoutingMode {
            RoutingMode::GatewayRouted
        }

        async fn attempt(
            &self,
            ctx: &AttemptContext,
            _request: &SessionRequest,
        ) -> std::result::Result<StrategyOutcome, StrategyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reservation = ctx.reserve()?;
            ctx.quarantine(reservation);
            Err(StrategyError::Remote(anyhow::anyhow!("connection refused")))
        }
    }

    #[test]
    fn missing_mode_requirements_are_config_errors() {
        let gateway = CoordinatorConfig {
            mode: Some(RoutingMode::GatewayRouted),
            ..Default::default()
        };
        assert!(matches!(
            SessionCoordinator::new(gateway, None),
            Err(CoordinatorError::Config(_))
        ));

        let registry_without_store = registry_config(43300..=43309);
        assert!(matches!(
            SessionCoordinator::new(registry_without_store, None),
            Err(CoordinatorError::Config(_))
        ));
    }

    #[test]
    fn mode_is_resolved_once_from_signals() {
        let config = CoordinatorConfig {
            signals: ModeSignals {
                gateway_url: None,
                registry_url: Some("sqlite::memory:".to_string()),
            },
            public_url: Some("http://gw".to_string()),
            ..Default::default()
        };
        let coordinator = SessionCoordinator::new(config, Some(registry())).unwrap();
        assert_eq!(coordinator.mode(), RoutingMode::RegistryDirect);
    }

    #[tokio::test]
    async fn reuse_and_revoke_round_trip() {
        let registry = registry();
        let coordinator =
            SessionCoordinator::new(registry_config(43310..=43339), Some(registry.clone()))
                .unwrap();

        let first = coordinator
            .get_or_create(SessionRequest::new("u1", "todo"))
            .await
            .unwrap();
        let p1 = first.port.unwrap();
        assert!(!first.reused);
        assert!(coordinator.ports().is_reserved(p1));
        assert_eq!(first.url, format!("http://gw:8080/s/{}/", first.token));

        let reserved_before = coordinator.ports().reserved_count();
        let again = coordinator
            .get_or_create(SessionRequest::new("u1", "todo"))
            .await
            .unwrap();
        assert!(again.reused);
        assert_eq!(again.token, first.token);
        assert_eq!(coordinator.ports().reserved_count(), reserved_before);

        assert!(coordinator.revoke_session(&first.token).await);
        assert!(!coordinator.ports().is_reserved(p1));
        assert!(registry.validate_token(&first.token).await.unwrap().is_none());
        assert!(!coordinator.revoke_session(&first.token).await);
    }

    #[tokio::test]
    async fn concurrent_requests_allocate_once() {
        let coordinator = Arc::new(
            SessionCoordinator::new(registry_config(43340..=43369), Some(registry())).unwrap(),
        );

        let a = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.get_or_create(SessionRequest::new("u1", "todo")).await })
        };
        let b = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.get_or_create(SessionRequest::new("u1", "todo")).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.token, b.token);
        assert_eq!(coordinator.ports().reserved_count(), 1);
        assert_eq!(coordinator.active_count().await, 1);
    }

    #[tokio::test]
    async fn remote_failure_falls_back_without_reusing_its_port() {
        let ports = PortAllocator::new(43470..=43479, localhost());
        let remote = Arc::new(FailingRemote {
            calls: AtomicUsize::new(0),
        });
        let coordinator = SessionCoordinator::with_strategies(
            RoutingMode::GatewayRouted,
            vec![
                remote.clone() as Arc<dyn SessionStrategy>,
                Arc::new(LocalStrategy::new("localhost", 60)),
            ],
            ports,
            "127.0.0.1",
        );

        let descriptor = coordinator
            .get_or_create(SessionRequest::new("u1", "todo"))
            .await
            .unwrap();

        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(descriptor.mode, RoutingMode::FullyLocal);
        assert!(descriptor.url.contains("?token="));
        // Only the local session's port stays held once the chain finishes.
        assert_eq!(coordinator.ports().reserved_count(), 1);
        assert!(coordinator.ports().is_reserved(descriptor.port.unwrap()));
    }

    #[tokio::test]
    async fn chain_failure_reports_last_mode() {
        let coordinator = SessionCoordinator::with_strategies(
            RoutingMode::GatewayRouted,
            vec![Arc::new(FailingRemote {
                calls: AtomicUsize::new(0),
            }) as Arc<dyn SessionStrategy>],
            PortAllocator::new(43480..=43481, localhost()),
            "127.0.0.1",
        );

        let err = coordinator
            .get_or_create(SessionRequest::new("u1", "todo"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Exhausted {
                mode: RoutingMode::GatewayRouted,
                ..
            }
        ));
        assert_eq!(coordinator.ports().reserved_count(), 0);
    }

    #[tokio::test]
    async fn start_session_binds_and_skips_rebind_on_reuse() {
        let coordinator = SessionCoordinator::new(
            CoordinatorConfig {
                mode: Some(RoutingMode::FullyLocal),
                port_range: 43380..=43399,
                bind_host: localhost(),
                ..Default::default()
            },
            None,
        )
        .unwrap();

        let started = coordinator
            .start_session(SessionRequest::new("u1", "todo"), bind_tcp)
            .await
            .unwrap();
        let listener = started.listener.expect("first start binds");
        assert_eq!(
            listener.local_addr().unwrap().port(),
            started.descriptor.port.unwrap()
        );

        let again = coordinator
            .start_session(SessionRequest::new("u1", "todo"), bind_tcp)
            .await
            .unwrap();
        assert!(again.descriptor.reused);
        assert!(again.listener.is_none());
    }

    #[tokio::test]
    async fn addr_in_use_retries_once_then_fails() {
        let coordinator = SessionCoordinator::new(
            CoordinatorConfig {
                mode: Some(RoutingMode::FullyLocal),
                port_range: 43400..=43419,
                bind_host: localhost(),
                ..Default::default()
            },
            None,
        )
        .unwrap();

        let attempts = AtomicUsize::new(0);
        let err = coordinator
            .start_session(SessionRequest::new("u1", "todo"), |addr| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(BindError::AddrInUse(addr)) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::PortConflict { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.active_count().await, 0);
        assert_eq!(coordinator.ports().reserved_count(), 0);
    }

    #[tokio::test]
    async fn addr_in_use_retry_uses_a_different_port() {
        let coordinator = SessionCoordinator::new(
            CoordinatorConfig {
                mode: Some(RoutingMode::FullyLocal),
                port_range: 43420..=43439,
                bind_host: localhost(),
                ..Default::default()
            },
            None,
        )
        .unwrap();

        let mut seen = Vec::new();
        let started = coordinator
            .start_session(SessionRequest::new("u1", "todo"), |addr: SocketAddr| {
                seen.push(addr.port());
                let first = seen.len() == 1;
                async move {
                    if first {
                        Err(BindError::AddrInUse(addr))
                    } else {
                        Ok(addr.port())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);
        assert_eq!(started.listener, Some(seen[1]));
        assert_eq!(coordinator.ports().reserved_count(), 1);
    }

    #[tokio::test]
    async fn close_releases_everything() {
        let registry = registry();
        let coordinator =
            SessionCoordinator::new(registry_config(43440..=43469), Some(registry.clone()))
                .unwrap();

        let a = coordinator
            .get_or_create(SessionRequest::new("u1", "todo"))
            .await
            .unwrap();
        let b = coordinator
            .get_or_create(SessionRequest::new("u2", "notes"))
            .await
            .unwrap();

        coordinator.close().await;

        assert_eq!(coordinator.ports().reserved_count(), 0);
        assert!(registry.validate_token(&a.token).await.unwrap().is_none());
        assert!(registry.validate_token(&b.token).await.unwrap().is_none());
        assert!(registry.get_registered_server("todo").await.unwrap().is_none());
    }
}
