// Listen / announce addresses for the overlay node

use super::OverlayError;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

/// Where the node binds and what it tells peers.
///
/// The two differ when the relay sits behind NAT or a TLS terminator: we
/// bind on all interfaces but advertise the name peers can actually reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddresses {
    pub listen: Multiaddr,
    pub announce: Option<Multiaddr>,
}

impl NodeAddresses {
    /// Derive the overlay addresses from the HTTP base port.
    ///
    /// An externally assigned port wins; otherwise the overlay takes
    /// `base_port + 1` and HTTP keeps the base port.
    pub fn from_ports(
        base_port: u16,
        external_port: Option<u16>,
        announce_host: &str,
    ) -> Result<Self, OverlayError> {
        let port = overlay_port(base_port, external_port).ok_or_else(|| {
            OverlayError::InvalidAddress(format!("no overlay port above {base_port}"))
        })?;

        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{port}")
            .parse()
            .map_err(|e| OverlayError::InvalidAddress(format!("listen address: {e}")))?;
        let announce = announce_addr(announce_host, port)?;

        Ok(Self {
            listen,
            announce: Some(announce),
        })
    }

    /// Bind only, advertise whatever the OS hands us.
    pub fn listen_only(listen: Multiaddr) -> Self {
        Self {
            listen,
            announce: None,
        }
    }
}

/// Overlay port for a given HTTP base port.
pub fn overlay_port(base_port: u16, external_port: Option<u16>) -> Option<u16> {
    match external_port {
        Some(port) => Some(port),
        None => base_port.checked_add(1),
    }
}

fn announce_addr(host: &str, port: u16) -> Result<Multiaddr, OverlayError> {
    let proto = match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V6(ip)) => Protocol::Ip6(ip),
        // the historical default advertises /dns4/0.0.0.0/tcp/<port>
        Ok(std::net::IpAddr::V4(ip)) if ip.is_unspecified() => {
            Protocol::Dns4(host.to_string().into())
        }
        Ok(std::net::IpAddr::V4(ip)) => Protocol::Ip4(ip),
        Err(_) if host.is_empty() => {
            return Err(OverlayError::InvalidAddress("empty announce host".into()))
        }
        Err(_) => Protocol::Dns4(host.to_string().into()),
    };

    let mut addr = Multiaddr::empty();
    addr.push(proto);
    addr.push(Protocol::Tcp(port));
    Ok(addr)
}

/// Append `/p2p/<peer_id>` unless the address already names a peer.
pub fn with_peer_id(mut addr: Multiaddr, peer_id: PeerId) -> Multiaddr {
    if !matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr.push(Protocol::P2p(peer_id));
    }
    addr
}

/// TCP port carried by a multiaddress, if any.
pub fn tcp_port(addr: &Multiaddr) -> Option<u16> {
    addr.iter().find_map(|p| match p {
        Protocol::Tcp(port) => Some(port),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_addresses() {
        let addrs = NodeAddresses::from_ports(4817, None, "0.0.0.0").unwrap();
        assert_eq!(addrs.listen.to_string(), "/ip4/0.0.0.0/tcp/4818");
        assert_eq!(
            addrs.announce.unwrap().to_string(),
            "/dns4/0.0.0.0/tcp/4818"
        );
    }

    #[test]
    fn test_external_port_wins() {
        let addrs = NodeAddresses::from_ports(8080, Some(443), "relay.example.org").unwrap();
        assert_eq!(addrs.listen.to_string(), "/ip4/0.0.0.0/tcp/443");
        assert_eq!(
            addrs.announce.unwrap().to_string(),
            "/dns4/relay.example.org/tcp/443"
        );
    }

    #[test]
    fn test_ipv4_announce_host() {
        let addrs = NodeAddresses::from_ports(4817, None, "203.0.113.7").unwrap();
        assert_eq!(addrs.announce.unwrap().to_string(), "/ip4/203.0.113.7/tcp/4818");
    }

    #[test]
    fn test_ipv6_announce_host() {
        let addrs = NodeAddresses::from_ports(4817, None, "::1").unwrap();
        assert_eq!(addrs.announce.unwrap().to_string(), "/ip6/::1/tcp/4818");
    }

    #[test]
    fn test_port_overflow_rejected() {
        assert!(NodeAddresses::from_ports(u16::MAX, None, "0.0.0.0").is_err());
        assert!(NodeAddresses::from_ports(u16::MAX, Some(443), "0.0.0.0").is_ok());
    }

    #[test]
    fn test_empty_host_rejected() {
        assert!(NodeAddresses::from_ports(4817, None, "").is_err());
    }

    #[test]
    fn test_with_peer_id_is_idempotent() {
        let peer_id = PeerId::random();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4818".parse().unwrap();

        let once = with_peer_id(addr, peer_id);
        let twice = with_peer_id(once.clone(), peer_id);
        assert_eq!(once, twice);
        assert!(once.to_string().ends_with(&format!("/p2p/{peer_id}")));
    }

    proptest! {
        #[test]
        fn prop_overlay_port_is_next_port(base in 0u16..u16::MAX) {
            prop_assert_eq!(overlay_port(base, None), Some(base + 1));
        }

        #[test]
        fn prop_external_port_always_used(base in any::<u16>(), external in any::<u16>()) {
            prop_assert_eq!(overlay_port(base, Some(external)), Some(external));
        }
    }
}
