//! Heartbeat liveness: silent peers are evicted, chatty ones never are.

mod common;

use std::time::Duration;

use common::{addr_of, init_tracing, start_node, test_config, wait_for_peer_presence};
use common::wait_for_connections;
use peerlink::ClusterConfig;

#[tokio::test]
async fn test_silent_peer_evicted() {
    init_tracing();
    // A beats often and tolerates only 300ms of silence; B beats so rarely
    // that, to A, it is mute.
    let config_a = ClusterConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let config_b = ClusterConfig {
        heartbeat_interval: Duration::from_secs(120),
        heartbeat_timeout: Duration::from_secs(120),
        ..test_config()
    };
    let (cluster_a, run_a) = start_node(config_a).await;
    let (cluster_b, run_b) = start_node(config_b).await;

    run_a.join(addr_of(&run_b));
    wait_for_connections(&cluster_a, 2, Duration::from_secs(5)).await;

    let peer_b = cluster_b.local_peer_id();
    let (conn, lock) = cluster_a.get_connection(&peer_b).unwrap();
    let mut drain = conn.drain_signal();
    drop(lock);
    drop(conn);

    // Eviction fires within the timeout plus check cadence slack.
    wait_for_peer_presence(&cluster_a, &peer_b, false, Duration::from_millis(800)).await;
    tokio::time::timeout(Duration::from_secs(2), drain.wait())
        .await
        .expect("drain signal fires after eviction");

    // B symmetrically loses A once the dead stream is observed.
    wait_for_peer_presence(
        &cluster_b,
        &cluster_a.local_peer_id(),
        false,
        Duration::from_secs(5),
    )
    .await;

    run_a.shutdown().await;
    run_b.shutdown().await;
}

#[tokio::test]
async fn test_heartbeats_keep_idle_connection_alive() {
    init_tracing();
    let config = ClusterConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(400),
        ..test_config()
    };
    let (cluster_a, run_a) = start_node(config.clone()).await;
    let (cluster_b, run_b) = start_node(config).await;

    run_a.join(addr_of(&run_b));
    wait_for_connections(&cluster_a, 2, Duration::from_secs(5)).await;
    wait_for_connections(&cluster_b, 2, Duration::from_secs(5)).await;

    // No application traffic at all: heartbeats alone must keep both sides
    // well inside the eviction window.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(cluster_a
        .get_connection(&cluster_b.local_peer_id())
        .is_some());
    assert!(cluster_b
        .get_connection(&cluster_a.local_peer_id())
        .is_some());

    // And beats did actually flow.
    let (conn, lock) = cluster_a
        .get_connection(&cluster_b.local_peer_id())
        .unwrap();
    let stats = conn.stats();
    assert!(stats.frames_sent > 0, "no heartbeats sent");
    assert!(stats.frames_received > 0, "no heartbeats received");
    drop(lock);

    run_a.shutdown().await;
    run_b.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_after_eviction_is_new_connection() {
    init_tracing();
    let (cluster_a, run_a) = start_node(test_config()).await;
    let (cluster_b, run_b) = start_node(test_config()).await;

    run_a.join(addr_of(&run_b));
    wait_for_connections(&cluster_a, 2, Duration::from_secs(5)).await;

    let peer_b = cluster_b.local_peer_id();
    let (first, lock) = cluster_a.get_connection(&peer_b).unwrap();
    let first_ptr = std::sync::Arc::as_ptr(&first);
    drop(lock);
    first.kill();
    drop(first);

    wait_for_peer_presence(&cluster_a, &peer_b, false, Duration::from_secs(5)).await;

    // A fresh join produces a fresh connection object; delivery does not
    // span the reconnect.
    run_a.join(addr_of(&run_b));
    wait_for_peer_presence(&cluster_a, &peer_b, true, Duration::from_secs(5)).await;
    let (second, lock) = cluster_a.get_connection(&peer_b).unwrap();
    assert_ne!(std::sync::Arc::as_ptr(&second), first_ptr);
    drop(lock);

    run_a.shutdown().await;
    run_b.shutdown().await;
}
