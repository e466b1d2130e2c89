//! Wire types for sessiongate.
//!
//! These types cross every boundary in the system:
//!
//! ```text
//! backend process --[coordinator]--> gateway control plane --> registry
//!                                          |
//! browser --[{prefix}/{token}/...]--> gateway data plane --> backend descriptor
//! ```
//!
//! JSON field names are camelCase on the wire.

pub mod backend;
pub mod control;

pub use backend::{BackendDescriptor, RouteTarget, RoutingError};
pub use control::{
    CreateSessionRequest, CreateSessionResponse, DiscoverServerResponse, ErrorBody,
    HealthResponse, RegisterServerRequest, RegisterServerResponse, RemoveServerResponse,
    RevokeSessionRequest, RevokeSessionResponse, SessionSummary, StatsResponse,
};

/// Server type used when a caller does not name one.
pub const DEFAULT_SERVER_TYPE: &str = "default";

/// Query parameter the gateway uses to hand the token to a backend.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Response header carrying the machine readable data-plane error code.
pub const GATEWAY_ERROR_HEADER: &str = "x-gateway-error";

/// Opaque key/value bag attached to sessions and registered servers.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
