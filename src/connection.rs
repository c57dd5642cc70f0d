//! The connection object: one live, framed, bidirectional link to a peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex};
use tracing::trace;

use crate::address::PeerAddress;
use crate::drain::{DrainSignal, Drainer};
use crate::framing;
use crate::{ClusterError, ClusterVersion, MessageTag, PeerId, Result};

/// An open connection to another peer, or the loopback connection to
/// ourselves.
///
/// If contact with a peer is lost and then regained, a new `Connection` is
/// created; there are never two `Connection`s for the same peer at once.
/// Code that handles a connection outside its own reader task carries a
/// [`DrainLock`](crate::DrainLock) so the object cannot be torn down while
/// in use; the paired [`DrainSignal`] doubles as the way to find out the
/// connection has been lost.
///
/// `Connection` is thread-safe: it can be shared across tasks and its
/// methods called from any of them.
#[derive(Debug)]
pub struct Connection {
    peer_id: PeerId,
    peer_address: PeerAddress,
    version: ClusterVersion,
    /// Serializes outbound frames; at most one writer at a time. Absent for
    /// the loopback connection.
    writer: Option<Mutex<OwnedWriteHalf>>,
    kill_tx: watch::Sender<bool>,
    drainer: Drainer,
    started: Instant,
    last_seen_ms: AtomicU64,
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_received: AtomicU64,
}

/// Point-in-time traffic counters for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub frames_received: u64,
}

impl Connection {
    pub(crate) fn new(
        peer_id: PeerId,
        peer_address: PeerAddress,
        version: ClusterVersion,
        writer: Option<OwnedWriteHalf>,
    ) -> Arc<Self> {
        let (kill_tx, _) = watch::channel(false);
        Arc::new(Self {
            peer_id,
            peer_address,
            version,
            writer: writer.map(Mutex::new),
            kill_tx,
            drainer: Drainer::new(),
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        })
    }

    /// Peer id of the other end. Ids change when a node restarts, but not
    /// when it loses and then regains contact.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Address of the other end. Carried here so lookups never have to go
    /// through the routing table.
    pub fn peer_address(&self) -> &PeerAddress {
        &self.peer_address
    }

    /// True for the loopback connection.
    pub fn is_loopback(&self) -> bool {
        self.writer.is_none()
    }

    /// Protocol version negotiated during the handshake.
    pub fn negotiated_version(&self) -> ClusterVersion {
        self.version
    }

    /// Drop the connection. Idempotent; teardown completes and the drain
    /// signal fires once every outstanding borrow has been released.
    pub fn kill(&self) {
        if !self.kill_tx.send_replace(true) {
            trace!(peer_id = %self.peer_id, "connection kill requested");
        }
    }

    /// Whether [`kill`](Self::kill) has been called or teardown has begun.
    pub fn is_killed(&self) -> bool {
        *self.kill_tx.borrow()
    }

    /// One-shot broadcast fired when the connection has fully torn down.
    pub fn drain_signal(&self) -> DrainSignal {
        self.drainer.signal()
    }

    /// Traffic counters.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn drainer(&self) -> &Drainer {
        &self.drainer
    }

    pub(crate) fn kill_signal(&self) -> watch::Receiver<bool> {
        self.kill_tx.subscribe()
    }

    /// Write one frame under the send mutex. Frames from concurrent senders
    /// appear on the wire in mutex acquisition order. Callers must hold a
    /// drain lock.
    pub(crate) async fn send_framed(&self, tag: MessageTag, payload: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .expect("send_framed called on loopback connection");

        let mut kill_rx = self.kill_tx.subscribe();
        let mut guard = writer.lock().await;
        let written = tokio::select! {
            biased;
            _ = kill_rx.wait_for(|killed| *killed) => {
                return Err(ClusterError::Network(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "connection is draining",
                )));
            }
            res = framing::write_frame(&mut *guard, tag, payload) => res?,
        };
        drop(guard);

        self.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        trace!(
            peer_id = %self.peer_id,
            tag,
            len = payload.len(),
            "frame sent"
        );
        Ok(())
    }

    /// Record one inbound frame, for stats and heartbeat liveness.
    pub(crate) fn note_frame_received(&self, frame_len: usize) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(frame_len as u64, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since establishment).
    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Close the write half. Called during teardown, after the connection
    /// has been removed from the registry.
    pub(crate) async fn shutdown_stream(&self) {
        if let Some(writer) = &self.writer {
            let _ = writer.lock().await.shutdown().await;
        }
    }
}
