//! The symmetric connection handshake.
//!
//! On a fresh TCP stream both sides write, then read, in order: the protocol
//! magic, the cluster version string, the architecture bit-size, the build
//! mode, an identify message (peer id + canonical addresses), and finally a
//! routing-table gossip message. The preamble strings are byte-exact and
//! must match across any two compatible builds.
//!
//! Structured payloads (identify, routing gossip) travel as a big-endian
//! `u32` length prefix followed by the archived bytes.

use std::collections::HashMap;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{HostPort, PeerAddress};
use crate::{ClusterError, ClusterVersion, PeerId, Result};

/// Fixed protocol magic opening every cluster stream.
pub const PREAMBLE_MAGIC: &[u8] = b"peerlink cluster\n";

/// Cluster version string. Any mismatch aborts the handshake.
pub const CLUSTER_VERSION_STRING: &str = "peerlink-1.0";

/// Architecture bit-size string. Mixed-width clusters are rejected.
pub const ARCH_BITSIZE_STRING: &str = if cfg!(target_pointer_width = "64") {
    "64"
} else {
    "32"
};

/// Build mode string. Mismatch warns (or aborts under strict mode).
pub const BUILD_MODE_STRING: &str = if cfg!(debug_assertions) {
    "debug"
} else {
    "release"
};

const MAX_PREAMBLE_STRING: usize = 64;
const MAX_IDENTIFY_SIZE: usize = 16 * 1024;
const MAX_GOSSIP_SIZE: usize = 1024 * 1024;

/// Identity announcement: who we are and where others can reach us.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct Identify {
    pub peer_id: PeerId,
    pub canonical: Vec<HostPort>,
}

/// One routing-table entry as gossiped during the handshake.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct RoutingGossipEntry {
    pub peer_id: PeerId,
    pub endpoints: Vec<HostPort>,
}

/// The sender's routing table, excluding the recipient, with the sender
/// itself included under its canonical addresses.
#[derive(Debug, Clone, Default, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct RoutingGossip {
    pub entries: Vec<RoutingGossipEntry>,
}

impl RoutingGossip {
    /// Build the gossip payload from a routing snapshot, dropping
    /// `recipient` and the loopback entry for `local` (re-added with the
    /// canonical addresses so the announcement is authoritative).
    pub fn from_snapshot(
        snapshot: &HashMap<PeerId, PeerAddress>,
        local: PeerId,
        local_canonical: &PeerAddress,
        recipient: PeerId,
    ) -> Self {
        let mut entries: Vec<RoutingGossipEntry> = snapshot
            .iter()
            .filter(|(peer, _)| **peer != local && **peer != recipient)
            .map(|(peer, addr)| RoutingGossipEntry {
                peer_id: *peer,
                endpoints: addr.endpoints().to_vec(),
            })
            .collect();
        entries.push(RoutingGossipEntry {
            peer_id: local,
            endpoints: local_canonical.endpoints().to_vec(),
        });
        entries.sort_by_key(|e| e.peer_id);
        Self { entries }
    }
}

/// Write a short length-prefixed string.
pub async fn write_string<W>(writer: &mut W, value: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = value.as_bytes();
    debug_assert!(bytes.len() <= MAX_PREAMBLE_STRING);
    writer.write_u16(bytes.len() as u16).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

/// Read a short length-prefixed string.
pub async fn read_string<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    if len > MAX_PREAMBLE_STRING {
        return Err(ClusterError::Protocol(format!(
            "preamble string too long: {len} bytes"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| ClusterError::Protocol("preamble string not UTF-8".to_string()))
}

async fn write_message_bytes<W>(writer: &mut W, bytes: &[u8], max: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > max {
        return Err(ClusterError::MessageTooLarge {
            size: bytes.len(),
            max,
        });
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message_bytes<R>(reader: &mut R, max: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 || len > max {
        return Err(ClusterError::Protocol(format!(
            "invalid handshake message size: {len} bytes"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write our half of the preamble (steps 1–4).
pub async fn write_preamble<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(PREAMBLE_MAGIC).await?;
    write_string(writer, CLUSTER_VERSION_STRING).await?;
    write_string(writer, ARCH_BITSIZE_STRING).await?;
    write_string(writer, BUILD_MODE_STRING).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and validate the peer's preamble. `build_mode_matched` in the result
/// is false when the peer runs the other build mode; the caller decides
/// whether that is fatal.
pub async fn read_preamble<R>(reader: &mut R) -> Result<PreambleOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut magic = vec![0u8; PREAMBLE_MAGIC.len()];
    reader.read_exact(&mut magic).await?;
    if magic != PREAMBLE_MAGIC {
        return Err(ClusterError::Protocol(
            "stream does not open with the cluster protocol magic".to_string(),
        ));
    }

    let version = read_string(reader).await?;
    if version != CLUSTER_VERSION_STRING {
        return Err(ClusterError::VersionSkew {
            ours: CLUSTER_VERSION_STRING.to_string(),
            theirs: version,
        });
    }

    let arch = read_string(reader).await?;
    if arch != ARCH_BITSIZE_STRING {
        return Err(ClusterError::ArchSkew {
            ours: ARCH_BITSIZE_STRING.to_string(),
            theirs: arch,
        });
    }

    let build_mode = read_string(reader).await?;
    Ok(PreambleOutcome {
        version: ClusterVersion::CURRENT,
        build_mode_matched: build_mode == BUILD_MODE_STRING,
        peer_build_mode: build_mode,
    })
}

/// Result of a validated preamble.
#[derive(Debug, Clone)]
pub struct PreambleOutcome {
    pub version: ClusterVersion,
    pub build_mode_matched: bool,
    pub peer_build_mode: String,
}

/// Steps 5–6: send our identify, read theirs.
pub async fn exchange_identify<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: &Identify,
) -> Result<Identify>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let encoded = rkyv::to_bytes::<rkyv::rancor::Error>(local)?;
    write_message_bytes(writer, &encoded, MAX_IDENTIFY_SIZE).await?;
    let bytes = read_message_bytes(reader, MAX_IDENTIFY_SIZE).await?;
    let remote: Identify = rkyv::from_bytes::<Identify, rkyv::rancor::Error>(&bytes)?;
    if remote.canonical.is_empty() {
        return Err(ClusterError::Protocol(
            "peer announced no canonical addresses".to_string(),
        ));
    }
    Ok(remote)
}

/// Step 7, send side.
pub async fn send_routing_gossip<W>(writer: &mut W, gossip: &RoutingGossip) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = rkyv::to_bytes::<rkyv::rancor::Error>(gossip)?;
    write_message_bytes(writer, &encoded, MAX_GOSSIP_SIZE).await
}

/// Step 7, receive side.
pub async fn read_routing_gossip<R>(reader: &mut R) -> Result<RoutingGossip>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_message_bytes(reader, MAX_GOSSIP_SIZE).await?;
    let gossip = rkyv::from_bytes::<RoutingGossip, rkyv::rancor::Error>(&bytes)?;
    Ok(gossip)
}
