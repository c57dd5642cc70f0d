#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use peerlink::{
    Cluster, ClusterBuilder, ClusterConfig, ClusterVersion, Connection, DrainLock, MessageHandler,
    PeerAddress, PeerId, Run,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Loopback-bound ephemeral-port config with test-friendly join timing.
pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        join_retry_interval: Duration::from_millis(100),
        ..ClusterConfig::loopback()
    }
}

pub async fn start_node(config: ClusterConfig) -> (Arc<Cluster>, Run) {
    start_node_with(config, Cluster::builder()).await
}

pub async fn start_node_with(
    config: ClusterConfig,
    builder: ClusterBuilder,
) -> (Arc<Cluster>, Run) {
    let cluster = builder.config(config).build();
    let run = Run::new(cluster.clone()).await.expect("run starts");
    (cluster, run)
}

/// The dialable address of a running node.
pub fn addr_of(run: &Run) -> PeerAddress {
    let ip = run.ips()[0];
    PeerAddress::from_socket_addr(SocketAddr::new(ip, run.port()))
}

/// Poll until the node's live-connection count (loopback included) reaches
/// `expected`, or panic after `deadline`.
pub async fn wait_for_connections(cluster: &Cluster, expected: usize, deadline: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        let count = cluster.connections_snapshot().len();
        if count == expected {
            return;
        }
        if start.elapsed() > deadline {
            panic!(
                "node {} still has {count} connections (wanted {expected}) after {deadline:?}",
                cluster.local_peer_id()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until `peer` is (or is not) present in the node's connection map.
pub async fn wait_for_peer_presence(
    cluster: &Cluster,
    peer: &PeerId,
    present: bool,
    deadline: Duration,
) {
    let start = tokio::time::Instant::now();
    loop {
        if cluster.get_connection(peer).is_some() == present {
            return;
        }
        if start.elapsed() > deadline {
            panic!(
                "peer {peer} presence={} not reached within {deadline:?}",
                present
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Handler that forwards every received payload (with the sending peer's
/// id) into a channel.
pub struct CaptureHandler {
    tx: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
}

impl CaptureHandler {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl MessageHandler for CaptureHandler {
    fn on_message(
        &self,
        conn: &Arc<Connection>,
        _keepalive: DrainLock,
        _version: ClusterVersion,
        payload: &[u8],
    ) -> peerlink::Result<()> {
        let _ = self.tx.send((conn.peer_id(), payload.to_vec()));
        Ok(())
    }
}
