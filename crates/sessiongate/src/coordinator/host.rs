//! Externally reachable host resolution.
//!
//! A remote gateway dials back to this process, so the advertised host must
//! not assume a shared network namespace.

use std::net::{IpAddr, Ipv4Addr};

use log::{debug, warn};

/// Override, else the first non-loopback IPv4 interface, else loopback.
pub fn pick_external_host(override_host: Option<&str>, interfaces: &[(String, IpAddr)]) -> String {
    if let Some(host) = override_host.map(str::trim).filter(|h| !h.is_empty()) {
        return host.to_string();
    }

    interfaces
        .iter()
        .find_map(|(name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => {
                debug!("Using interface {} ({}) as external host", name, v4);
                Some(v4.to_string())
            }
            _ => None,
        })
        .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string())
}

/// [`pick_external_host`] over the machine's interfaces.
pub fn resolve_external_host(override_host: Option<&str>) -> String {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list,
        Err(e) => {
            warn!("Failed to list network interfaces: {}", e);
            Vec::new()
        }
    };
    pick_external_host(override_host, &interfaces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn ifaces() -> Vec<(String, IpAddr)> {
        vec![
            ("lo".to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ("eth0".to_string(), IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))),
            ("eth0".to_string(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))),
            ("wlan0".to_string(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 4))),
        ]
    }

    #[test]
    fn override_wins() {
        assert_eq!(pick_external_host(Some("gw-peer.internal"), &ifaces()), "gw-peer.internal");
    }

    #[test]
    fn blank_override_is_ignored() {
        assert_eq!(pick_external_host(Some("  "), &ifaces()), "10.0.0.7");
    }

    #[test]
    fn first_non_loopback_ipv4() {
        assert_eq!(pick_external_host(None, &ifaces()), "10.0.0.7");
    }

    #[test]
    fn loopback_as_last_resort() {
        let only_lo = vec![("lo".to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST))];
        assert_eq!(pick_external_host(None, &only_lo), "127.0.0.1");
        assert_eq!(pick_external_host(None, &[]), "127.0.0.1");
    }
}
