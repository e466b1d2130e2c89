//! Session strategies, tried in order until one yields a session.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use sessiongate_protocol::{BackendDescriptor, CreateSessionResponse};

use super::client::GatewayClient;
use super::error::StrategyError;
use super::mode::RoutingMode;
use super::models::{SessionDescriptor, SessionRequest};
use super::ports::{PortAllocator, PortError, PortReservation};
use crate::auth::redact;
use crate::registry::{RegistryError, TokenRegistry, expiry_after};

/// Shared state for one run of the strategy chain.
///
/// Ports claimed by a failed attempt are parked here until the whole chain
/// finishes, so a later strategy cannot be handed the same port.
pub struct AttemptContext {
    ports: PortAllocator,
    external_host: String,
    quarantine: Mutex<Vec<PortReservation>>,
}

impl AttemptContext {
    pub fn new(ports: PortAllocator, external_host: impl Into<String>) -> Self {
        Self {
            ports,
            external_host: external_host.into(),
            quarantine: Mutex::new(Vec::new()),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Host a remote gateway should dial to reach this process.
    pub fn external_host(&self) -> &str {
        &self.external_host
    }

    pub fn reserve(&self) -> Result<PortReservation, PortError> {
        self.ports.reserve()
    }

    /// Hold a failed attempt's port until the chain ends.
    pub fn quarantine(&self, reservation: PortReservation) {
        debug!("Holding port {} from failed attempt", reservation.port());
        self.quarantine
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(reservation);
    }

    pub fn quarantined_ports(&self) -> Vec<u16> {
        self.quarantine
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(PortReservation::port)
            .collect()
    }
}

/// A successful attempt.
#[derive(Debug)]
pub struct StrategyOutcome {
    pub descriptor: SessionDescriptor,
    /// Port held for the session's lifetime.
    pub reservation: Option<PortReservation>,
    /// This attempt registered `server_name` with the backend address.
    pub published: bool,
}

#[async_trait]
pub trait SessionStrategy: Send + Sync {
    fn mode(&self) -> RoutingMode;

    async fn attempt(
        &self,
        ctx: &AttemptContext,
        request: &SessionRequest,
    ) -> Result<StrategyOutcome, StrategyError>;

    /// Undo what a successful attempt published. Best effort.
    async fn release(&self, _session: &SessionDescriptor, _published: bool) {}
}

fn gateway_url(public_url: &str, prefix: &str, token: &str) -> String {
    format!("{}{}/{}/", public_url.trim_end_matches('/'), prefix, token)
}

// ---------------------------------------------------------------------------
// Gateway-routed
// ---------------------------------------------------------------------------

/// Creates sessions through a remote gateway's control plane.
pub struct GatewayStrategy {
    client: GatewayClient,
    public_url: String,
    prefix: String,
}

impl GatewayStrategy {
    /// `public_url` is the gateway base browsers use; often the same as the
    /// control-plane URL.
    pub fn new(client: GatewayClient, public_url: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            public_url: public_url.into(),
            prefix: prefix.into(),
        }
    }

    /// Existing registration for the server, unless the gateway cannot route
    /// to it or it points at a port this process already holds for something
    /// else.
    async fn discover(
        &self,
        ctx: &AttemptContext,
        server_name: &str,
    ) -> Result<Option<BackendDescriptor>, StrategyError> {
        let found = self
            .client
            .discover_server(server_name)
            .await
            .map_err(StrategyError::Remote)?;

        let Some(found) = found else {
            return Ok(None);
        };
        let backend = found.backend;

        if let Err(e) = backend.route_target() {
            warn!(
                "Ignoring discovered backend {} for {}: {}",
                backend, server_name, e
            );
            return Ok(None);
        }
        if let Some(port) = backend.port()
            && ctx.ports().is_reserved(port)
        {
            warn!(
                "Ignoring discovered backend {} for {}: port {} is reserved by this process",
                backend, server_name, port
            );
            return Ok(None);
        }
        Ok(Some(backend))
    }

    /// Create, replacing a stale session the gateway would otherwise reuse
    /// for a backend we did not just publish.
    async fn create(
        &self,
        request: &SessionRequest,
        backend: BackendDescriptor,
        discovered: bool,
    ) -> anyhow::Result<CreateSessionResponse> {
        let body = request.to_create_request(backend);
        let created = self.client.create_session(&body).await?;
        if !created.reused || discovered {
            return Ok(created);
        }

        info!(
            "Gateway reused session {} for a different backend; replacing it",
            created.session_id
        );
        self.client.revoke_session(&created.token).await?;
        self.client.create_session(&body).await
    }

    async fn unpublish(&self, server_name: &str, backend: &BackendDescriptor) {
        match self.client.discover_server(server_name).await {
            Ok(Some(found)) if &found.backend == backend => {
                if let Err(e) = self.client.unregister_server(server_name).await {
                    warn!("Failed to unregister {} from gateway: {:#}", server_name, e);
                }
            }
            Ok(_) => debug!("Registration for {} no longer ours; leaving it", server_name),
            Err(e) => warn!("Failed to look up {} on gateway: {:#}", server_name, e),
        }
    }
}

#[async_trait]
impl SessionStrategy for GatewayStrategy {
    fn mode(&self) -> RoutingMode {
        RoutingMode::GatewayRouted
    }

    async fn attempt(
        &self,
        ctx: &AttemptContext,
        request: &SessionRequest,
    ) -> Result<StrategyOutcome, StrategyError> {
        let discovered = self.discover(ctx, &request.server_name).await?;

        let (backend, reservation) = match discovered {
            Some(backend) => {
                debug!("Using registered backend {} for {}", backend, request.server_name);
                (backend, None)
            }
            None => {
                let reservation = ctx.reserve()?;
                let backend = BackendDescriptor::tcp(ctx.external_host(), reservation.port());
                if let Err(e) = self
                    .client
                    .register_server(
                        &request.server_name,
                        backend.clone(),
                        Some(request.metadata.clone()),
                    )
                    .await
                {
                    ctx.quarantine(reservation);
                    return Err(StrategyError::Remote(e));
                }
                (backend, Some(reservation))
            }
        };
        let published = reservation.is_some();

        let created = match self.create(request, backend.clone(), !published).await {
            Ok(created) => created,
            Err(e) => {
                if published {
                    self.unpublish(&request.server_name, &backend).await;
                }
                if let Some(reservation) = reservation {
                    ctx.quarantine(reservation);
                }
                return Err(StrategyError::Remote(e));
            }
        };

        info!(
            "Gateway session {} for {}/{} -> {}",
            redact(&created.token),
            request.user_id,
            request.server_name,
            backend
        );

        Ok(StrategyOutcome {
            descriptor: SessionDescriptor {
                mode: RoutingMode::GatewayRouted,
                url: gateway_url(&self.public_url, &self.prefix, &created.token),
                token: created.token,
                session_id: created.session_id,
                user_id: request.user_id.clone(),
                server_name: request.server_name.clone(),
                port: reservation.as_ref().map(PortReservation::port),
                backend,
                expires_at: created.expires_at,
                reused: false,
                discovered: !published,
            },
            reservation,
            published,
        })
    }

    async fn release(&self, session: &SessionDescriptor, published: bool) {
        if let Err(e) = self.client.revoke_session(&session.token).await {
            warn!(
                "Failed to revoke session {} on gateway: {:#}",
                redact(&session.token),
                e
            );
        }
        if published {
            self.unpublish(&session.server_name, &session.backend).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry-direct
// ---------------------------------------------------------------------------

/// Writes sessions straight into a registry a gateway also reads.
pub struct RegistryStrategy {
    registry: TokenRegistry,
    public_url: String,
    prefix: String,
}

impl RegistryStrategy {
    pub fn new(registry: TokenRegistry, public_url: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            public_url: public_url.into(),
            prefix: prefix.into(),
        }
    }

    async fn publish_and_create(
        &self,
        request: &SessionRequest,
        backend: &BackendDescriptor,
    ) -> Result<crate::registry::EphemeralSession, RegistryError> {
        self.registry
            .register_server(
                &request.server_name,
                backend.clone(),
                Some(request.metadata.clone()),
            )
            .await?;

        let new = request.to_new_session(backend.clone());
        let (session, reused) = self.registry.find_or_create_session(new.clone()).await?;
        if reused && &session.backend != backend {
            info!(
                "Replacing session {} bound to {} with one for {}",
                session.session_id, session.backend, backend
            );
            self.registry.revoke_session(&session.token).await?;
            return self.registry.create_session(new).await;
        }
        Ok(session)
    }

    async fn unpublish(&self, server_name: &str, backend: &BackendDescriptor) {
        match self.registry.get_registered_server(server_name).await {
            Ok(Some(server)) if &server.backend == backend => {
                if let Err(e) = self.registry.unregister_server(server_name).await {
                    warn!("Failed to unregister {}: {}", server_name, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to look up {}: {}", server_name, e),
        }
    }
}

#[async_trait]
impl SessionStrategy for RegistryStrategy {
    fn mode(&self) -> RoutingMode {
        RoutingMode::RegistryDirect
    }

    async fn attempt(
        &self,
        ctx: &AttemptContext,
        request: &SessionRequest,
    ) -> Result<StrategyOutcome, StrategyError> {
        let reservation = ctx.reserve()?;
        let backend = BackendDescriptor::tcp(ctx.external_host(), reservation.port());

        let session = match self.publish_and_create(request, &backend).await {
            Ok(session) => session,
            Err(e) => {
                self.unpublish(&request.server_name, &backend).await;
                ctx.quarantine(reservation);
                return Err(e.into());
            }
        };

        Ok(StrategyOutcome {
            descriptor: SessionDescriptor {
                mode: RoutingMode::RegistryDirect,
                url: gateway_url(&self.public_url, &self.prefix, &session.token),
                token: session.token,
                session_id: session.session_id,
                user_id: session.user_id,
                server_name: session.server_name,
                port: Some(reservation.port()),
                backend,
                expires_at: session.expires_at,
                reused: false,
                discovered: false,
            },
            reservation: Some(reservation),
            published: true,
        })
    }

    async fn release(&self, session: &SessionDescriptor, published: bool) {
        if let Err(e) = self.registry.revoke_session(&session.token).await {
            warn!("Failed to revoke session {}: {}", redact(&session.token), e);
        }
        if published {
            self.unpublish(&session.server_name, &session.backend).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Fully local
// ---------------------------------------------------------------------------

/// No gateway: the backend checks the token itself.
pub struct LocalStrategy {
    host: String,
    default_ttl_minutes: i64,
}

impl LocalStrategy {
    pub fn new(host: impl Into<String>, default_ttl_minutes: i64) -> Self {
        Self {
            host: host.into(),
            default_ttl_minutes,
        }
    }
}

#[async_trait]
impl SessionStrategy for LocalStrategy {
    fn mode(&self) -> RoutingMode {
        RoutingMode::FullyLocal
    }

    async fn attempt(
        &self,
        ctx: &AttemptContext,
        request: &SessionRequest,
    ) -> Result<StrategyOutcome, StrategyError> {
        let ttl = request.ttl_minutes.unwrap_or(self.default_ttl_minutes);
        let expires_at = expiry_after(Utc::now(), ttl).ok_or_else(|| {
            RegistryError::InvalidRequest(format!("ttlMinutes out of range: {}", ttl))
        })?;
        let reservation = ctx.reserve()?;
        let port = reservation.port();
        let token = nanoid::nanoid!(32);

        Ok(StrategyOutcome {
            descriptor: SessionDescriptor {
                mode: RoutingMode::FullyLocal,
                url: format!(
                    "http://{}:{}/?{}={}",
                    self.host,
                    port,
                    sessiongate_protocol::TOKEN_QUERY_PARAM,
                    urlencoding::encode(&token)
                ),
                token,
                session_id: uuid::Uuid::new_v4().to_string(),
                user_id: request.user_id.clone(),
                server_name: request.server_name.clone(),
                port: Some(port),
                backend: BackendDescriptor::tcp(self.host.clone(), port),
                expires_at,
                reused: false,
                discovered: false,
            },
            reservation: Some(reservation),
            published: false,
        })
    }
}
