//! Routing mode selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Environment variable naming the gateway control-plane URL.
pub const GATEWAY_URL_ENV: &str = "SESSIONGATE_GATEWAY_URL";
/// Environment variable naming a shared registry store.
pub const REGISTRY_URL_ENV: &str = "SESSIONGATE_REGISTRY_URL";

/// How sessions reach their backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// Sessions created through a remote gateway's control plane.
    GatewayRouted,
    /// Sessions written straight into a shared registry; a gateway reading
    /// the same store routes them.
    RegistryDirect,
    /// No gateway. The URL points at this process with the token as a query
    /// parameter.
    FullyLocal,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::GatewayRouted => "gateway-routed",
            RoutingMode::RegistryDirect => "registry-direct",
            RoutingMode::FullyLocal => "fully-local",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gateway" | "gateway-routed" => Ok(RoutingMode::GatewayRouted),
            "registry" | "registry-direct" => Ok(RoutingMode::RegistryDirect),
            "local" | "fully-local" => Ok(RoutingMode::FullyLocal),
            _ => Err(format!("unknown routing mode: {}", s)),
        }
    }
}

/// Environment facts that influence mode selection. Read once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeSignals {
    pub gateway_url: Option<String>,
    pub registry_url: Option<String>,
}

impl ModeSignals {
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            gateway_url: read(GATEWAY_URL_ENV),
            registry_url: read(REGISTRY_URL_ENV),
        }
    }
}

/// Explicit choice, else environment signal, else fully local.
pub fn select_mode(explicit: Option<RoutingMode>, signals: &ModeSignals) -> RoutingMode {
    if let Some(mode) = explicit {
        return mode;
    }
    if signals.gateway_url.is_some() {
        return RoutingMode::GatewayRouted;
    }
    if signals.registry_url.is_some() {
        return RoutingMode::RegistryDirect;
    }
    RoutingMode::FullyLocal
}
