//! Routing and attempt tables.
//!
//! The routing table maps every peer we can currently reach (including peers
//! mid-handshake or mid-teardown) to its address; it is a superset of the
//! live-connection map. Insertion is the simultaneous-connect tiebreaker: of
//! two connections handshaking with the same peer, only the one whose
//! insertion succeeds survives.
//!
//! The attempt table records host:port pairs currently being dialed or
//! already connected, so a repeated `join` to the same address is a no-op.
//! This matters in particular with a fixed client port, where the kernel
//! cannot keep two outbound flows to one address apart.
//!
//! Lock order: attempt table before routing table, never the reverse, and
//! neither is ever held across I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::address::{HostPort, PeerAddress};
use crate::PeerId;

#[derive(Debug, Default)]
struct RoutingInner {
    // This mutex is the new-connection serialization point: insertions from
    // racing handshakes are ordered here and the loser closes.
    map: Mutex<HashMap<PeerId, PeerAddress>>,
}

/// Known-peer map. Writes go through [`RoutingTable::try_add`], which hands
/// back an RAII sentry; dropping the sentry removes the entry.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    inner: Arc<RoutingInner>,
}

/// Sentry for one routing-table entry. Removal on drop runs on every exit
/// path of the owning connection task.
#[derive(Debug)]
pub struct RoutingEntry {
    inner: Arc<RoutingInner>,
    peer: PeerId,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `(peer, address)` unless an entry for `peer` already exists.
    /// `None` means the caller lost the new-connection race.
    pub fn try_add(&self, peer: PeerId, address: PeerAddress) -> Option<RoutingEntry> {
        let mut map = self.inner.map.lock().expect("routing table poisoned");
        if map.contains_key(&peer) {
            return None;
        }
        map.insert(peer, address);
        Some(RoutingEntry {
            inner: self.inner.clone(),
            peer,
        })
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.inner
            .map
            .lock()
            .expect("routing table poisoned")
            .contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerAddress> {
        self.inner
            .map
            .lock()
            .expect("routing table poisoned")
            .get(peer)
            .cloned()
    }

    pub fn snapshot(&self) -> HashMap<PeerId, PeerAddress> {
        self.inner
            .map
            .lock()
            .expect("routing table poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.map.lock().expect("routing table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RoutingEntry {
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl Drop for RoutingEntry {
    fn drop(&mut self) {
        let mut map = self.inner.map.lock().expect("routing table poisoned");
        map.remove(&self.peer);
    }
}

#[derive(Debug, Default)]
struct AttemptInner {
    set: Mutex<HashSet<HostPort>>,
}

/// In-flight dial dedup set.
#[derive(Debug, Clone, Default)]
pub struct AttemptTable {
    inner: Arc<AttemptInner>,
}

/// Reservation of one host:port attempt; released on drop.
#[derive(Debug)]
pub struct AttemptGuard {
    inner: Arc<AttemptInner>,
    key: HostPort,
}

impl AttemptTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `key`, or `None` if an attempt for it is already in flight.
    pub fn reserve(&self, key: HostPort) -> Option<AttemptGuard> {
        let mut set = self.inner.set.lock().expect("attempt table poisoned");
        if !set.insert(key.clone()) {
            return None;
        }
        Some(AttemptGuard {
            inner: self.inner.clone(),
            key,
        })
    }

    pub fn contains(&self, key: &HostPort) -> bool {
        self.inner
            .set
            .lock()
            .expect("attempt table poisoned")
            .contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.set.lock().expect("attempt table poisoned").len()
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        let mut set = self.inner.set.lock().expect("attempt table poisoned");
        set.remove(&self.key);
    }
}
