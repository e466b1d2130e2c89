//! Application state shared across handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Body;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::registry::TokenRegistry;

/// Gateway settings for the API layer.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Data-plane path prefix, e.g. `/s`.
    pub prefix: String,
    /// Connect + response-header budget for proxied HTTP requests.
    pub request_timeout: Duration,
    /// Idle budget for relayed WebSocket connections.
    pub ws_idle_timeout: Duration,
    /// Max buffered request body size.
    pub max_body_bytes: usize,
    /// CORS origins. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            prefix: "/s".to_string(),
            request_timeout: Duration::from_secs(30),
            ws_idle_timeout: Duration::from_secs(3600),
            max_body_bytes: 10 * 1024 * 1024,
            allowed_origins: Vec::new(),
        }
    }
}

/// Relayed WebSocket connections.
///
/// Relays outlive the request that created them, so they are tracked here
/// for the shutdown stage that closes them.
#[derive(Debug, Clone, Default)]
pub struct WebSocketRelays {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl WebSocketRelays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Fires when relays must close.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Ask every relay to close, then wait up to `grace` for them to finish.
    /// Returns false when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let open = self.tracker.len();
        if open > 0 {
            info!("Closing {} WebSocket relay(s)", open);
        }
        self.cancel.cancel();
        self.tracker.close();

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "{} WebSocket relay(s) still open after {:?}",
                    self.tracker.len(),
                    grace
                );
                false
            }
        }
    }
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session and server registry.
    pub registry: TokenRegistry,
    /// HTTP client for TCP backends.
    pub http_client: Client<HttpConnector, Body>,
    /// HTTP client for Unix-socket backends.
    pub unix_client: Client<UnixConnector, Body>,
    pub settings: Arc<GatewaySettings>,
    /// Set by the first shutdown stage. New sessions are refused.
    pub draining: Arc<AtomicBool>,
    pub websockets: WebSocketRelays,
}

impl AppState {
    /// Create new application state.
    pub fn new(registry: TokenRegistry, settings: GatewaySettings) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(settings.request_timeout));
        connector.set_nodelay(true);

        let http_client: Client<HttpConnector, Body> =
            Client::builder(TokioExecutor::new()).build(connector);
        let unix_client: Client<UnixConnector, Body> =
            Client::builder(TokioExecutor::new()).build(UnixConnector);

        Self {
            registry,
            http_client,
            unix_client,
            settings: Arc::new(settings),
            draining: Arc::new(AtomicBool::new(false)),
            websockets: WebSocketRelays::new(),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// First shutdown stage: refuse new sessions, keep serving existing ones.
    pub fn start_draining(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            info!("Gateway draining: refusing new sessions");
        }
    }
}
