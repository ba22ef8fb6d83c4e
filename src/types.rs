//! Network constants and identity types.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lowest protocol level this library can negotiate.
pub const LEVEL_MINIMUM: u32 = 31402;
/// Nonced ping/pong (BIP31).
pub const LEVEL_BIP31: u32 = 60001;
/// Relay flag in the version message (BIP37).
pub const LEVEL_BIP37: u32 = 70001;
/// Reject messages (BIP61).
pub const LEVEL_BIP61: u32 = 70002;
/// Highest protocol level this library can negotiate.
pub const LEVEL_MAXIMUM: u32 = 70002;

/// No services advertised.
pub const NODE_NONE: u64 = 0;
/// The node can serve the full block chain.
pub const NODE_NETWORK: u64 = 1;
/// The node can serve witness data.
pub const NODE_WITNESS: u64 = 1 << 3;

/// User agent included in outbound version messages.
pub const USER_AGENT: &str = concat!("/goshawk:", env!("CARGO_PKG_VERSION"), "/");

/// Seconds since the unix epoch.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A remote endpoint identifier.
///
/// Equality is over the full `(ip, port)` tuple; blacklist matching is
/// prefix-based and lives in [`crate::config::Subnet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authority {
    pub ip: IpAddr,
    pub port: u16,
}

impl Authority {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The unroutable placeholder, used when self is not configured.
    pub fn unspecified() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Network address view with the given services and a fresh timestamp.
    pub fn to_network_address(&self, services: u64) -> NetworkAddress {
        NetworkAddress {
            services,
            ip: self.ip,
            port: self.port,
            timestamp: unix_time(),
        }
    }
}

impl From<SocketAddr> for Authority {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

impl FromStr for Authority {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(Self::from)
    }
}

/// A gossiped peer address with its advertised services and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
    /// Self-reported last-seen time in unix seconds; untrusted.
    pub timestamp: u64,
}

impl NetworkAddress {
    pub fn authority(&self) -> Authority {
        Authority {
            ip: self.ip,
            port: self.port,
        }
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.authority())
    }
}

/// Connection direction, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Inbound,
    Outbound,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Inbound => write!(f, "inbound"),
            Link::Outbound => write!(f, "outbound"),
        }
    }
}

/// Snapshot of the node's best block, reflected in outbound handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopBlock {
    pub height: u64,
    pub hash: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_parse_roundtrip() {
        let authority: Authority = "10.1.2.3:8333".parse().unwrap();
        assert_eq!(authority.port, 8333);
        assert_eq!(authority.to_string(), "10.1.2.3:8333");

        let v6: Authority = "[::1]:18333".parse().unwrap();
        assert_eq!(v6.to_string(), "[::1]:18333");
    }

    #[test]
    fn network_address_view() {
        let authority: Authority = "1.2.3.4:8333".parse().unwrap();
        let address = authority.to_network_address(NODE_NETWORK);
        assert_eq!(address.authority(), authority);
        assert_eq!(address.services, NODE_NETWORK);
    }
}
