//! The live-connection registry.
//!
//! Holds one entry per fully established peer (ourselves included, through
//! the loopback connection). Point reads go through a lock-free map so any
//! task can look up a peer without cross-task hops; observers subscribe to
//! immutable snapshots published on every add and remove.
//!
//! The registry entry owns a drain lock for its connection, so nobody can
//! find a connection here after teardown has removed it: removal happens
//! before the connection's drainer fires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::connection::Connection;
use crate::drain::DrainLock;
use crate::{ClusterError, PeerId, Result};

/// One registry entry: the connection plus the keepalive the registry holds
/// for it.
#[derive(Debug, Clone)]
pub struct ConnectionSlot {
    pub connection: Arc<Connection>,
    pub keepalive: DrainLock,
}

/// Immutable snapshot of the live-connection set. Holding a snapshot holds
/// a borrow on every connection in it, so drop snapshots promptly.
pub type ConnectionMap = Arc<HashMap<PeerId, ConnectionSlot>>;

#[derive(Debug)]
pub struct ConnectionRegistry {
    live: DashMap<PeerId, ConnectionSlot>,
    snapshot_tx: watch::Sender<ConnectionMap>,
    // Serializes snapshot rebuilds so publications can't reorder.
    publish: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(HashMap::new()));
        Self {
            live: DashMap::new(),
            snapshot_tx,
            publish: Mutex::new(()),
        }
    }

    /// Register a fully established connection and publish the new snapshot.
    /// The routing-table tiebreak guarantees at most one live connection per
    /// peer, so an occupied slot here is a protocol violation.
    pub(crate) fn insert(&self, connection: Arc<Connection>) -> Result<()> {
        let peer_id = connection.peer_id();
        let keepalive = connection.drainer().lock().ok_or_else(|| {
            ClusterError::Protocol(format!("connection to {peer_id} drained before registration"))
        })?;

        let slot = ConnectionSlot {
            connection,
            keepalive,
        };
        if self.live.insert(peer_id, slot).is_some() {
            // Unreachable while the routing-table invariant holds.
            return Err(ClusterError::Protocol(format!(
                "duplicate live connection for peer {peer_id}"
            )));
        }
        self.publish_snapshot();
        debug!(peer_id = %peer_id, live = self.live.len(), "connection registered");
        Ok(())
    }

    /// Withdraw a connection. Its registry keepalive drops here, before the
    /// caller drains the connection.
    pub(crate) fn remove(&self, peer_id: &PeerId) {
        if self.live.remove(peer_id).is_some() {
            self.publish_snapshot();
            debug!(peer_id = %peer_id, live = self.live.len(), "connection deregistered");
        }
    }

    /// Look up one peer. Returns the connection and a fresh drain lock; the
    /// connection stays valid, and its drain signal unfired, at least until
    /// the lock is dropped. `None` if the peer is absent or tearing down.
    pub fn get(&self, peer_id: &PeerId) -> Option<(Arc<Connection>, DrainLock)> {
        let slot = self.live.get(peer_id)?;
        let lock = slot.connection.drainer().lock()?;
        Some((slot.connection.clone(), lock))
    }

    /// Subscribe to snapshot publications. The first borrow yields the
    /// current set; every add or remove publishes a new value.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionMap> {
        self.snapshot_tx.subscribe()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ConnectionMap {
        self.snapshot_tx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.live.contains_key(peer_id)
    }

    fn publish_snapshot(&self) {
        let _guard = self.publish.lock().expect("registry publish poisoned");
        let snapshot: HashMap<PeerId, ConnectionSlot> = self
            .live
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
