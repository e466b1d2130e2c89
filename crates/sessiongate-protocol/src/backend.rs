//! Backend descriptors: where a session's traffic actually goes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tagged address of the process serving a session.
///
/// `Gateway` carries no physical target. It marks sessions whose content is
/// served by the gateway itself and must never be dialed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendDescriptor {
    Tcp {
        host: String,
        port: u16,
    },
    Unix {
        #[serde(rename = "socketPath")]
        socket_path: String,
    },
    Gateway {},
}

/// A descriptor that passed routing validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Tcp { host: String, port: u16 },
    Unix { socket_path: String },
}

/// Why a descriptor cannot be used as a proxy target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The descriptor is the informational `gateway` variant.
    NotRoutable,
    /// A required field is empty or zero.
    MissingField(&'static str),
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::NotRoutable => write!(f, "gateway descriptor has no routable target"),
            RoutingError::MissingField(field) => {
                write!(f, "backend descriptor is missing required field '{}'", field)
            }
        }
    }
}

impl std::error::Error for RoutingError {}

impl BackendDescriptor {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        BackendDescriptor::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(socket_path: impl Into<String>) -> Self {
        BackendDescriptor::Unix {
            socket_path: socket_path.into(),
        }
    }

    /// Short type name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendDescriptor::Tcp { .. } => "tcp",
            BackendDescriptor::Unix { .. } => "unix",
            BackendDescriptor::Gateway {} => "gateway",
        }
    }

    /// TCP port, if this is a TCP descriptor.
    pub fn port(&self) -> Option<u16> {
        match self {
            BackendDescriptor::Tcp { port, .. } => Some(*port),
            _ => None,
        }
    }

    /// Validate the descriptor for routing. Never defaults a missing value.
    pub fn route_target(&self) -> Result<RouteTarget, RoutingError> {
        match self {
            BackendDescriptor::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return Err(RoutingError::MissingField("host"));
                }
                if *port == 0 {
                    return Err(RoutingError::MissingField("port"));
                }
                Ok(RouteTarget::Tcp {
                    host: host.clone(),
                    port: *port,
                })
            }
            BackendDescriptor::Unix { socket_path } => {
                if socket_path.trim().is_empty() {
                    return Err(RoutingError::MissingField("socketPath"));
                }
                Ok(RouteTarget::Unix {
                    socket_path: socket_path.clone(),
                })
            }
            BackendDescriptor::Gateway {} => Err(RoutingError::NotRoutable),
        }
    }
}

impl fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendDescriptor::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            BackendDescriptor::Unix { socket_path } => write!(f, "unix://{}", socket_path),
            BackendDescriptor::Gateway {} => write!(f, "gateway"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_matches_tagged_variants() {
        let tcp = serde_json::to_value(BackendDescriptor::tcp("10.0.0.2", 8501)).unwrap();
        assert_eq!(tcp, json!({"type": "tcp", "host": "10.0.0.2", "port": 8501}));

        let unix = serde_json::to_value(BackendDescriptor::unix("/run/app.sock")).unwrap();
        assert_eq!(unix, json!({"type": "unix", "socketPath": "/run/app.sock"}));

        let gateway = serde_json::to_value(BackendDescriptor::Gateway {}).unwrap();
        assert_eq!(gateway, json!({"type": "gateway"}));
    }

    #[test]
    fn parses_gateway_without_fields() {
        let parsed: BackendDescriptor = serde_json::from_value(json!({"type": "gateway"})).unwrap();
        assert_eq!(parsed, BackendDescriptor::Gateway {});
    }

    #[test]
    fn tcp_missing_port_is_rejected_on_parse() {
        let parsed = serde_json::from_value::<BackendDescriptor>(json!({"type": "tcp", "host": "a"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn gateway_is_never_routable() {
        assert_eq!(
            BackendDescriptor::Gateway {}.route_target(),
            Err(RoutingError::NotRoutable)
        );
    }

    #[test]
    fn empty_fields_are_routing_errors() {
        assert_eq!(
            BackendDescriptor::tcp("", 80).route_target(),
            Err(RoutingError::MissingField("host"))
        );
        assert_eq!(
            BackendDescriptor::tcp("localhost", 0).route_target(),
            Err(RoutingError::MissingField("port"))
        );
        assert_eq!(
            BackendDescriptor::unix(" ").route_target(),
            Err(RoutingError::MissingField("socketPath"))
        );
    }

    #[test]
    fn valid_tcp_routes() {
        assert_eq!(
            BackendDescriptor::tcp("127.0.0.1", 9000).route_target(),
            Ok(RouteTarget::Tcp {
                host: "127.0.0.1".to_string(),
                port: 9000
            })
        );
    }
}
