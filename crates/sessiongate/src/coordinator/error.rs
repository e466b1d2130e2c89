//! Coordinator errors.

use thiserror::Error;

use super::mode::RoutingMode;
use super::ports::{BindError, PortError};
use crate::registry::RegistryError;

/// Why one strategy in the chain could not produce a session. Every variant
/// lets the chain move on to the next strategy.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Gateway control-plane call failed (discovery, registration, creation).
    #[error("gateway call failed: {0:#}")]
    Remote(#[source] anyhow::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Port(#[from] PortError),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid session request: {0}")]
    InvalidRequest(String),

    /// Mode cannot run with the given configuration.
    #[error("coordinator misconfigured: {0}")]
    Config(String),

    /// The last strategy in the chain failed.
    #[error("{mode} session creation failed: {source}")]
    Exhausted {
        mode: RoutingMode,
        #[source]
        source: StrategyError,
    },

    /// The allocated port stayed in use after one retry.
    #[error("port {port} still in use after retry")]
    PortConflict { port: u16 },

    #[error(transparent)]
    Bind(#[from] BindError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
