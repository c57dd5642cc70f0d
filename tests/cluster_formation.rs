//! Cluster formation: explicit joins and routing-table gossip.

mod common;

use std::time::Duration;

use common::{addr_of, init_tracing, start_node, test_config, wait_for_connections};
use peerlink::{ClusterConfig, PeerAddress};

#[tokio::test]
async fn test_two_node_join() {
    init_tracing();
    let (cluster_a, run_a) = start_node(test_config()).await;
    let (cluster_b, run_b) = start_node(test_config()).await;

    run_a.join(addr_of(&run_b));

    wait_for_connections(&cluster_a, 2, Duration::from_secs(5)).await;
    wait_for_connections(&cluster_b, 2, Duration::from_secs(5)).await;

    // Each side can reach the other by id.
    let (conn, lock) = cluster_a
        .get_connection(&cluster_b.local_peer_id())
        .expect("a sees b");
    assert_eq!(conn.peer_id(), cluster_b.local_peer_id());
    assert!(!conn.is_loopback());
    drop(lock);

    assert!(cluster_b
        .get_connection(&cluster_a.local_peer_id())
        .is_some());

    run_a.shutdown().await;
    run_b.shutdown().await;
}

#[tokio::test]
async fn test_loopback_connection_present_at_start() {
    init_tracing();
    let (cluster, run) = start_node(test_config()).await;

    let me = cluster.local_peer_id();
    let (conn, lock) = cluster.get_connection(&me).expect("loopback registered");
    assert!(conn.is_loopback());
    assert_eq!(conn.peer_id(), me);
    drop(lock);

    run.shutdown().await;
    assert!(cluster.get_connection(&me).is_none());
}

#[tokio::test]
async fn test_three_node_gossip_convergence() {
    init_tracing();
    let (cluster_a, run_a) = start_node(test_config()).await;
    let (cluster_b, run_b) = start_node(test_config()).await;
    let (cluster_c, run_c) = start_node(test_config()).await;

    run_a.join(addr_of(&run_b));
    wait_for_connections(&cluster_a, 2, Duration::from_secs(5)).await;
    wait_for_connections(&cluster_b, 2, Duration::from_secs(5)).await;

    // C only joins A; it must learn about B through the routing gossip and
    // connect without any further explicit join.
    run_c.join(addr_of(&run_a));
    wait_for_connections(&cluster_a, 3, Duration::from_secs(10)).await;
    wait_for_connections(&cluster_b, 3, Duration::from_secs(10)).await;
    wait_for_connections(&cluster_c, 3, Duration::from_secs(10)).await;

    for cluster in [&cluster_a, &cluster_b, &cluster_c] {
        for other in [&cluster_a, &cluster_b, &cluster_c] {
            assert!(
                cluster.get_connection(&other.local_peer_id()).is_some(),
                "{} cannot reach {}",
                cluster.local_peer_id(),
                other.local_peer_id()
            );
        }
    }

    run_a.shutdown().await;
    run_b.shutdown().await;
    run_c.shutdown().await;
}

#[tokio::test]
async fn test_repeated_join_converges_to_single_connection() {
    init_tracing();
    let (cluster_a, run_a) = start_node(test_config()).await;
    let (cluster_b, run_b) = start_node(test_config()).await;

    // Repeated joins for an address already being attempted (or already
    // connected) are no-ops.
    for _ in 0..5 {
        run_a.join(addr_of(&run_b));
    }

    wait_for_connections(&cluster_a, 2, Duration::from_secs(5)).await;
    wait_for_connections(&cluster_b, 2, Duration::from_secs(5)).await;

    // Give any redundant dials time to land, then confirm nothing changed.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster_a.connections_snapshot().len(), 2);
    assert_eq!(cluster_b.connections_snapshot().len(), 2);

    run_a.shutdown().await;
    run_b.shutdown().await;
}

#[tokio::test]
async fn test_join_unreachable_address_gives_up_quietly() {
    init_tracing();
    let config = ClusterConfig {
        max_join_attempts: 2,
        join_retry_interval: Duration::from_millis(50),
        ..test_config()
    };
    let (cluster, run) = start_node(config).await;

    // Nothing listens here; the join must retry its cap and give up without
    // disturbing the node.
    let unused = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        addr
    };
    run.join(PeerAddress::from_socket_addr(unused));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(cluster.connections_snapshot().len(), 1);

    run.shutdown().await;
}

#[tokio::test]
async fn test_address_in_use_surfaces() {
    init_tracing();
    let (_cluster_a, run_a) = start_node(test_config()).await;

    let config = ClusterConfig {
        listen_port: run_a.port(),
        ..test_config()
    };
    let cluster_b = peerlink::Cluster::builder().config(config).build();
    let err = peerlink::Run::new(cluster_b).await.unwrap_err();
    assert!(matches!(err, peerlink::ClusterError::AddressInUse(_)));

    run_a.shutdown().await;
}

#[tokio::test]
async fn test_second_run_rejected_while_active() {
    init_tracing();
    let (cluster, run) = start_node(test_config()).await;

    let err = peerlink::Run::new(cluster.clone()).await.unwrap_err();
    assert!(matches!(err, peerlink::ClusterError::InvalidConfig(_)));

    run.shutdown().await;

    // After shutdown a fresh run is possible again.
    let run2 = peerlink::Run::new(cluster.clone()).await.unwrap();
    run2.shutdown().await;
}
