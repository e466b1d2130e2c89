//! Session coordinator: turns a caller identity into a session URL plus a
//! port to bind, keeping what the gateway routes to consistent with what
//! this process actually binds.

mod client;
mod error;
mod host;
mod mode;
mod models;
mod ports;
mod service;
mod strategy;

pub use client::GatewayClient;
pub use error::{CoordinatorError, StrategyError};
pub use host::{pick_external_host, resolve_external_host};
pub use mode::{GATEWAY_URL_ENV, ModeSignals, REGISTRY_URL_ENV, RoutingMode, select_mode};
pub use models::{SessionDescriptor, SessionRequest};
pub use ports::{
    BindError, DEFAULT_PORT_RANGE, PortAllocator, PortError, PortReservation, bind_tcp,
};
pub use service::{CoordinatorConfig, SessionCoordinator, StartedSession};
pub use strategy::{
    AttemptContext, GatewayStrategy, LocalStrategy, RegistryStrategy, SessionStrategy,
    StrategyOutcome,
};
