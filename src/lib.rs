//! Low-level cluster connectivity for a distributed database.
//!
//! `peerlink` establishes and maintains exactly one live connection to each
//! reachable peer, multiplexes tagged messages over those connections, and
//! publishes a consistent view of the connection set to higher-level
//! subsystems (directory, mailbox, query routing). It is deliberately
//! low-level; most code builds on top of it rather than using it directly.
//!
//! Clustering is based around the [`Connection`]: when a [`Run`] starts we
//! create a loopback connection to ourselves and begin accepting TCP
//! connections on the cluster port. Each accepted or dialed stream goes
//! through a symmetric handshake (protocol magic, version, identity, routing
//! table), and on success a `Connection` is registered under the peer's id.
//! If contact with a peer is lost and later regained, the new link is a new
//! `Connection` with no relation to the old one.
//!
//! Messages are framed as `[tag][varint length][payload]` and dispatched to
//! the [`MessageHandler`] registered for the tag. Handlers are installed
//! through [`ClusterBuilder`] and frozen before any `Run` exists. Tag `b'H'`
//! is reserved for the built-in heartbeat manager, which evicts peers that
//! go silent.
//!
//! Messages on one connection are delivered in the order they were sent.
//! There is no ordering between connections, and no delivery across a
//! reconnect.

pub mod address;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod drain;
pub mod framing;
pub mod handshake;
pub mod heartbeat;
pub mod registry;
pub mod routing;
pub mod run;

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub use address::{HostPort, PeerAddress};
pub use cluster::{Cluster, ClusterBuilder};
pub use config::ClusterConfig;
pub use connection::{Connection, ConnectionStats};
pub use dispatch::MessageHandler;
pub use drain::{DrainLock, DrainSignal};
pub use registry::{ConnectionMap, ConnectionSlot};
pub use run::Run;

/// Every cluster message carries a one-byte tag selecting the handler on the
/// receiving side. Tags are a low-level concept; there are only a few of
/// them (one per subsystem), and higher-level code routes through those
/// subsystems rather than claiming tags of its own.
pub type MessageTag = u8;

/// Number of distinct message tags.
pub const MAX_MESSAGE_TAG: usize = 256;

/// Reserved exclusively for heartbeat frames.
pub const HEARTBEAT_TAG: MessageTag = b'H';

/// Peer identifier: an opaque 128-bit value generated once per process
/// start. Two processes never collide (probabilistically), and a restart
/// produces a new id even on the same host and port.
#[derive(
    Clone,
    Copy,
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
pub struct PeerId([u8; 16]);

impl PeerId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 16];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw byte representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Full hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 4 bytes as hex, for logging.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fmt_short())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({}…)", self.fmt_short())
    }
}

/// Cluster protocol version negotiated during the handshake.
///
/// The handshake aborts on any version-string mismatch, so today the
/// negotiated version always equals [`ClusterVersion::CURRENT`]; the type
/// exists so that handlers are already written against a negotiated value
/// when a second version appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ClusterVersion {
    V1,
}

impl ClusterVersion {
    /// The version this build speaks.
    pub const CURRENT: ClusterVersion = ClusterVersion::V1;

    /// The exact string written on the wire during the preamble.
    pub fn wire_string(&self) -> &'static str {
        match self {
            ClusterVersion::V1 => handshake::CLUSTER_VERSION_STRING,
        }
    }
}

/// Errors produced by the connectivity core.
///
/// Per-connection errors are recovered locally by tearing down the single
/// affected connection; the cluster as a whole stays up. Only [`Run`]
/// construction errors surface to the caller.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rkyv::rancor::Error),

    #[error("cluster version skew: ours {ours:?}, theirs {theirs:?}")]
    VersionSkew { ours: String, theirs: String },

    #[error("architecture skew: ours {ours:?}, theirs {theirs:?}")]
    ArchSkew { ours: String, theirs: String },

    #[error("build mode skew: ours {ours:?}, theirs {theirs:?}")]
    BuildModeSkew { ours: String, theirs: String },

    #[error("lost simultaneous-connect race")]
    RaceLost,

    #[error("address already in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("no handler registered for tag {0:#04x}")]
    HandlerMissing(u8),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("operation timed out")]
    Timeout,

    #[error("cluster shutting down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClusterError {
    /// True for transport-level failures that a fresh dial may fix.
    ///
    /// Protocol, version-skew, and race-loss failures are not retryable:
    /// redialing the same address immediately would only reproduce them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Network(_) | ClusterError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
