//! Peer addressing: host:port endpoints and order-insensitive endpoint sets.

use std::net::{IpAddr, SocketAddr};

use crate::{ClusterError, Result};

/// A single reachable `host:port` endpoint.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            host: ip.to_string(),
            port,
        }
    }

    /// Resolve to socket addresses for dialing.
    pub async fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        Ok(addrs.collect())
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

/// The set of endpoints a peer can be reached at, plus nothing else: the set
/// is immutable once observed. A peer that changes addresses shows up as a
/// new `PeerAddress` bound to a new connection attempt.
///
/// Equality ignores endpoint order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    // Sorted and deduplicated, which is what makes derived equality
    // order-insensitive.
    endpoints: Vec<HostPort>,
}

impl PeerAddress {
    /// Build from a non-empty endpoint list. Duplicates collapse.
    pub fn new(mut endpoints: Vec<HostPort>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "peer address needs at least one endpoint".to_string(),
            ));
        }
        endpoints.sort();
        endpoints.dedup();
        Ok(Self { endpoints })
    }

    pub fn from_host_port(endpoint: HostPort) -> Self {
        Self {
            endpoints: vec![endpoint],
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_host_port(HostPort::from_socket_addr(addr))
    }

    pub fn endpoints(&self) -> &[HostPort] {
        &self.endpoints
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostPort> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        false // constructor guarantees at least one endpoint
    }

    pub fn contains(&self, endpoint: &HostPort) -> bool {
        self.endpoints.binary_search(endpoint).is_ok()
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for ep in &self.endpoints {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{ep}")?;
            first = false;
        }
        Ok(())
    }
}
