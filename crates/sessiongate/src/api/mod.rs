//! Gateway HTTP surface.
//!
//! Control plane (JSON): session creation and revocation, server
//! registration and discovery, health and stats.
//! Data plane: `{prefix}/{token}/...` proxied to the session's backend.

mod error;
mod handlers;
pub mod proxy;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ProxyError};
pub use routes::create_router;
pub use state::{AppState, GatewaySettings, WebSocketRelays};
