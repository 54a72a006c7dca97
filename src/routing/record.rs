//! Peer records stored in the routing table

use crate::crypto::NodeId;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Network location of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// IP address the peer is reachable at
    pub address: IpAddr,
    /// Discovery (UDP) port
    pub udp_port: u16,
    /// RLPx (TCP) port, `None` for peers that do not accept connections
    pub tcp_port: Option<u16>,
}

impl Endpoint {
    pub fn new(address: IpAddr, udp_port: u16, tcp_port: Option<u16>) -> Self {
        Self {
            address,
            udp_port,
            tcp_port,
        }
    }

    /// Endpoint where both protocols share one port
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port(), Some(addr.port()))
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_port.map(|port| SocketAddr::new(self.address, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tcp_port {
            Some(tcp) => write!(f, "{}:{}:{}", self.address, self.udp_port, tcp),
            None => write!(f, "{}:{}", self.address, self.udp_port),
        }
    }
}

/// A verified peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: NodeId,
    pub endpoint: Endpoint,
    /// When the peer last answered a discovery ping
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            last_seen: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_endpoint_addresses() {
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 30303, Some(30304));
        assert_eq!(ep.udp_addr().port(), 30303);
        assert_eq!(ep.tcp_addr().map(|a| a.port()), Some(30304));
        assert_eq!(ep.to_string(), "127.0.0.1:30303:30304");

        let outbound_only = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 30303, None);
        assert!(outbound_only.tcp_addr().is_none());
    }
}
