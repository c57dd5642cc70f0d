//! The cluster object: identity, frozen handler table, and the published
//! connection set.
//!
//! A [`Cluster`] is built once per process via [`ClusterBuilder`], after all
//! message handlers are known. Starting a [`Run`](crate::Run) is what
//! actually brings the node onto the network; the `Cluster` outlives runs,
//! so handlers are never invoked after the run that delivered to them has
//! shut down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

use crate::config::ClusterConfig;
use crate::connection::Connection;
use crate::dispatch::{HandlerTable, MessageHandler};
use crate::drain::DrainLock;
use crate::heartbeat::HeartbeatManager;
use crate::registry::{ConnectionMap, ConnectionRegistry};
use crate::{
    ClusterError, ClusterVersion, MessageTag, PeerId, Result, HEARTBEAT_TAG, MAX_MESSAGE_TAG,
};

/// Builder that collects message handlers and freezes them into a
/// [`Cluster`]. Registration is only possible here, before any run exists.
pub struct ClusterBuilder {
    config: ClusterConfig,
    slots: [Option<Arc<dyn MessageHandler>>; MAX_MESSAGE_TAG],
}

impl std::fmt::Debug for ClusterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterBuilder")
            .field("config", &self.config)
            .field(
                "slots",
                &self.slots.iter().filter(|s| s.is_some()).count(),
            )
            .finish()
    }
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            config: ClusterConfig::default(),
            slots: std::array::from_fn(|_| None),
        }
    }

    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind `handler` to `tag`. Tag `b'H'` is reserved for the heartbeat
    /// manager, and each tag takes at most one handler.
    pub fn handler(mut self, tag: MessageTag, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        if tag == HEARTBEAT_TAG {
            return Err(ClusterError::InvalidConfig(format!(
                "tag {tag:#04x} is reserved for heartbeat"
            )));
        }
        if self.slots[tag as usize].is_some() {
            return Err(ClusterError::InvalidConfig(format!(
                "tag {tag:#04x} already has a handler"
            )));
        }
        self.slots[tag as usize] = Some(handler);
        Ok(self)
    }

    /// Freeze the handler table and mint the node's identity.
    pub fn build(mut self) -> Arc<Cluster> {
        self.slots[HEARTBEAT_TAG as usize] = Some(Arc::new(HeartbeatManager::new()));
        Arc::new(Cluster {
            me: PeerId::random(),
            config: self.config,
            handlers: HandlerTable::from_slots(self.slots),
            registry: ConnectionRegistry::new(),
            run_active: AtomicBool::new(false),
        })
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The connectivity core. Establishes connections with other nodes and
/// carries messages between them; everything above (directory, mailbox,
/// query routing) builds on this.
#[derive(Debug)]
pub struct Cluster {
    me: PeerId,
    config: ClusterConfig,
    handlers: HandlerTable,
    registry: ConnectionRegistry,
    run_active: AtomicBool,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    /// Our own peer id, stable for the lifetime of this process.
    pub fn local_peer_id(&self) -> PeerId {
        self.me
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Shortcut for accessing one connection, by far the most common case.
    /// While the returned lock is held the connection stays valid and its
    /// drain signal will not fire.
    pub fn get_connection(&self, peer: &PeerId) -> Option<(Arc<Connection>, DrainLock)> {
        self.registry.get(peer)
    }

    /// Subscribe to the live-connection set. Each published value is an
    /// immutable snapshot; holding one borrows every connection in it.
    pub fn connections_view(&self) -> watch::Receiver<ConnectionMap> {
        self.registry.subscribe()
    }

    /// Current live-connection snapshot.
    pub fn connections_snapshot(&self) -> ConnectionMap {
        self.registry.snapshot()
    }

    /// Send one tagged message. `write` produces the payload given the
    /// negotiated version. On the loopback connection the handler's local
    /// fast path runs synchronously on the calling task and nothing touches
    /// a socket; otherwise the frame is written under the connection's send
    /// mutex.
    pub async fn send_message<F>(
        &self,
        conn: &Arc<Connection>,
        keepalive: DrainLock,
        tag: MessageTag,
        write: F,
    ) -> Result<()>
    where
        F: FnOnce(ClusterVersion, &mut Vec<u8>) -> std::io::Result<()>,
    {
        let version = conn.negotiated_version();
        let mut payload = Vec::new();
        write(version, &mut payload).map_err(ClusterError::Network)?;
        if payload.len() > self.config.max_message_size {
            return Err(ClusterError::MessageTooLarge {
                size: payload.len(),
                max: self.config.max_message_size,
            });
        }

        if conn.is_loopback() {
            trace!(tag, len = payload.len(), "loopback message dispatched");
            let handler = self
                .handlers
                .get(tag)
                .ok_or(ClusterError::HandlerMissing(tag))?;
            return handler.on_local_message(conn, keepalive, version, payload);
        }

        let result = conn.send_framed(tag, &payload).await;
        if result.is_err() {
            // A failed write leaves the stream in an unknown state; the
            // connection cannot be used again.
            conn.kill();
        }
        drop(keepalive);
        result
    }

    pub(crate) fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub(crate) fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Claim the single-run slot. Fails while another run exists.
    pub(crate) fn try_claim_run(&self) -> bool {
        self.run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_run(&self) {
        self.run_active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopHandler;

    impl MessageHandler for NopHandler {
        fn on_message(
            &self,
            _conn: &Arc<Connection>,
            _keepalive: DrainLock,
            _version: ClusterVersion,
            _payload: &[u8],
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_heartbeat_tag_reserved() {
        let err = Cluster::builder()
            .handler(HEARTBEAT_TAG, Arc::new(NopHandler))
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidConfig(_)));
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let builder = Cluster::builder()
            .handler(b'D', Arc::new(NopHandler))
            .unwrap();
        assert!(builder.handler(b'D', Arc::new(NopHandler)).is_err());
    }

    #[test]
    fn test_build_installs_heartbeat_handler() {
        let cluster = Cluster::builder().build();
        assert!(cluster.handlers().get(HEARTBEAT_TAG).is_some());
    }

    #[test]
    fn test_fresh_cluster_has_distinct_identity() {
        let a = Cluster::builder().build();
        let b = Cluster::builder().build();
        assert_ne!(a.local_peer_id(), b.local_peer_id());
        assert!(a.connections_snapshot().is_empty());
    }

    #[test]
    fn test_run_slot_single_claim() {
        let cluster = Cluster::builder().build();
        assert!(cluster.try_claim_run());
        assert!(!cluster.try_claim_run());
        cluster.release_run();
        assert!(cluster.try_claim_run());
    }
}
