//! Local interface checks for listener bind addresses

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::warn;

/// Answers whether an address belongs to one of this host's interfaces
#[cfg_attr(test, mockall::automock)]
pub trait InterfaceAddrs: Send + Sync {
    fn contains(&self, ip: IpAddr) -> bool;
}

/// Checks addresses against the running host by attempting to bind them.
///
/// Binding an ephemeral UDP port only succeeds for addresses assigned to a
/// local interface, so no enumeration is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceAddrs for SystemInterfaces {
    fn contains(&self, ip: IpAddr) -> bool {
        if ip.is_unspecified() || ip.is_loopback() {
            return true;
        }
        UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
    }
}

/// `""`, `0.0.0.0` and `::` all mean every interface
pub fn is_wildcard(host: &str) -> bool {
    let host = host.trim();
    host.is_empty()
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false)
}

/// Pick the host a listener should bind.
///
/// Wildcards are kept. A specific address that is not one of ours falls back to
/// `0.0.0.0` so the listener still comes up.
pub fn resolve_bind_host(host: &str, interfaces: &dyn InterfaceAddrs) -> String {
    let host = host.trim();
    if host.is_empty() {
        return Ipv4Addr::UNSPECIFIED.to_string();
    }
    if is_wildcard(host) {
        return host.to_string();
    }

    let local = match host.parse::<IpAddr>() {
        Ok(ip) => interfaces.contains(ip),
        Err(_) => {
            warn!(host = %host, "Listener host is not an IP address");
            false
        }
    };

    if local {
        host.to_string()
    } else {
        warn!(host = %host, "Host is not a local interface, binding 0.0.0.0 instead");
        Ipv4Addr::UNSPECIFIED.to_string()
    }
}
