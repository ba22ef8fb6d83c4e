//! Network configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::types::{Authority, LEVEL_MAXIMUM, LEVEL_MINIMUM, NODE_NETWORK, NODE_NONE, USER_AGENT};

/// An IP prefix, for blacklisting.
///
/// Matching is address-only: a blacklisted prefix blocks every port on
/// the covered hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub ip: IpAddr,
    /// Prefix length in bits; full length means a single host.
    pub prefix: u8,
}

impl Subnet {
    pub fn host(ip: IpAddr) -> Self {
        let prefix = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { ip, prefix }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.ip, ip) {
            (IpAddr::V4(net), IpAddr::V4(host)) => {
                let prefix = u32::from(self.prefix.min(32));
                let mask = if prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - prefix)
                };
                (u32::from(net) & mask) == (u32::from(*host) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(host)) => {
                let prefix = u32::from(self.prefix.min(128));
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix)
                };
                (u128::from(net) & mask) == (u128::from(*host) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = Error;

    /// Parses "10.0.0.0/8" or a bare host address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ip, prefix)) => {
                let ip: IpAddr = ip.parse().map_err(|_| Error::OperationFailed)?;
                let prefix: u8 = prefix.parse().map_err(|_| Error::OperationFailed)?;
                let limit = match ip {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                if prefix > limit {
                    return Err(Error::OperationFailed);
                }
                Ok(Self { ip, prefix })
            }
            None => {
                let ip: IpAddr = s.parse().map_err(|_| Error::OperationFailed)?;
                Ok(Self::host(ip))
            }
        }
    }
}

/// A configured peer or seed endpoint, possibly a hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<Authority> for Endpoint {
    fn from(authority: Authority) -> Self {
        Self {
            host: authority.ip.to_string(),
            port: authority.port,
        }
    }
}

/// Recognised network options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker count for a dedicated I/O runtime (see [`Config::runtime`]).
    pub threads: usize,
    /// Highest protocol level to negotiate.
    pub protocol_maximum: u32,
    /// Lowest protocol level to accept.
    pub protocol_minimum: u32,
    /// Own advertised service bits.
    pub services: u64,
    /// Peer service bits that disqualify a peer outright.
    pub invalid_services: u64,
    /// Peer service bits required of every peer.
    pub minimum_services: u64,
    /// Whether to request transaction relay (BIP37 version flag).
    pub relay_transactions: bool,
    /// Handshake deadline.
    pub channel_handshake: Duration,
    /// Ping cadence.
    pub channel_heartbeat: Duration,
    /// Inbound silence before disconnect.
    pub channel_inactivity: Duration,
    /// Maximum channel lifetime.
    pub channel_expiration: Duration,
    /// Per-dial timeout.
    pub connect_timeout: Duration,
    /// Base delay before retrying a failed connect cycle.
    pub connect_cycle_delay: Duration,
    /// Backoff ceiling for repeated failures.
    pub connect_cycle_delay_maximum: Duration,
    /// Address pool capacity; zero disables the address protocol.
    pub host_pool_capacity: usize,
    /// Address pool persistence path; `None` keeps the pool ephemeral.
    pub hosts_file: Option<PathBuf>,
    /// Target concurrent outbound channels.
    pub outbound_connections: usize,
    /// Hard cap on inbound channels; zero disables the inbound session.
    pub inbound_connections: usize,
    /// Parallel dials per outbound connect cycle.
    pub connect_batch_size: usize,
    /// Inbound listen endpoint.
    pub bind: Authority,
    /// Persistent manual peers.
    pub peers: Vec<Endpoint>,
    /// Seed endpoints for address pool bootstrap.
    pub seeds: Vec<Endpoint>,
    /// IP-prefix denylist.
    pub blacklists: Vec<Subnet>,
    /// Own advertised address; port zero disables self announcement.
    pub self_address: Authority,
    /// User agent sent in the version message.
    pub user_agent: String,
    /// Seed for the injected pseudo-random source; `None` seeds from
    /// entropy. Tests pin this for reproducible nonces and jitter.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 4,
            protocol_maximum: LEVEL_MAXIMUM,
            protocol_minimum: LEVEL_MINIMUM,
            services: NODE_NETWORK,
            invalid_services: NODE_NONE,
            minimum_services: NODE_NETWORK,
            relay_transactions: true,
            channel_handshake: Duration::from_secs(30),
            channel_heartbeat: Duration::from_secs(120),
            channel_inactivity: Duration::from_secs(600),
            channel_expiration: Duration::from_secs(5400),
            connect_timeout: Duration::from_secs(5),
            connect_cycle_delay: Duration::from_secs(5),
            connect_cycle_delay_maximum: Duration::from_secs(300),
            host_pool_capacity: 1000,
            hosts_file: None,
            outbound_connections: 8,
            inbound_connections: 117,
            connect_batch_size: 5,
            bind: Authority::unspecified(),
            peers: Vec::new(),
            seeds: Vec::new(),
            blacklists: Vec::new(),
            self_address: Authority::unspecified(),
            user_agent: USER_AGENT.to_owned(),
            rng_seed: None,
        }
    }
}

impl Config {
    /// Enforce the protocol-range invariants.
    pub fn validate(&self) -> Result<(), Error> {
        if self.protocol_minimum < LEVEL_MINIMUM
            || self.protocol_maximum > LEVEL_MAXIMUM
            || self.protocol_minimum > self.protocol_maximum
        {
            return Err(Error::OperationFailed);
        }
        Ok(())
    }

    /// Whether the authority's IP falls under a blacklisted prefix.
    pub fn blacklisted(&self, authority: &Authority) -> bool {
        self.blacklists
            .iter()
            .any(|subnet| subnet.contains(&authority.ip))
    }

    /// Build a dedicated multi-thread runtime sized by `threads`, for
    /// nodes that isolate network I/O from their own pool.
    pub fn runtime(&self) -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.threads.max(1))
            .thread_name("goshawk-net")
            .enable_all()
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_inverted_protocol_range() {
        let config = Config {
            protocol_minimum: LEVEL_MAXIMUM,
            protocol_maximum: LEVEL_MINIMUM,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(Error::OperationFailed));
    }

    #[test]
    fn subnet_prefix_matching() {
        let subnet: Subnet = "10.2.0.0/16".parse().unwrap();
        assert!(subnet.contains(&"10.2.3.4".parse().unwrap()));
        assert!(!subnet.contains(&"10.3.0.1".parse().unwrap()));
        assert!(!subnet.contains(&"::1".parse().unwrap()));

        let host: Subnet = "192.168.1.1".parse().unwrap();
        assert!(host.contains(&"192.168.1.1".parse().unwrap()));
        assert!(!host.contains(&"192.168.1.2".parse().unwrap()));
    }

    #[test]
    fn blacklist_matches_ip_only() {
        let config = Config {
            blacklists: vec!["10.0.0.0/8".parse().unwrap()],
            ..Config::default()
        };
        assert!(config.blacklisted(&"10.9.9.9:8333".parse().unwrap()));
        assert!(config.blacklisted(&"10.9.9.9:1".parse().unwrap()));
        assert!(!config.blacklisted(&"11.0.0.1:8333".parse().unwrap()));
    }
}
