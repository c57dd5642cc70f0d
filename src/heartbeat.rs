//! Heartbeats and silence-based eviction.
//!
//! Every live non-loopback connection gets an empty frame on the reserved
//! heartbeat tag each interval. Any inbound frame counts as liveness, so a
//! busy connection never pays for dedicated beats; a connection silent for
//! the full timeout is killed. Timeouts are the normal eviction mechanism,
//! not errors.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::cluster::Cluster;
use crate::connection::Connection;
use crate::dispatch::MessageHandler;
use crate::drain::DrainLock;
use crate::{ClusterVersion, Result, HEARTBEAT_TAG};

/// Handler bound to the reserved heartbeat tag. Inbound beats carry no
/// payload and need no action: the reader task already recorded the frame
/// as liveness before dispatching it here.
#[derive(Debug, Default)]
pub struct HeartbeatManager;

impl HeartbeatManager {
    pub fn new() -> Self {
        Self
    }
}

impl MessageHandler for HeartbeatManager {
    fn on_message(
        &self,
        conn: &Arc<Connection>,
        _keepalive: DrainLock,
        _version: ClusterVersion,
        _payload: &[u8],
    ) -> Result<()> {
        trace!(peer_id = %conn.peer_id(), "heartbeat received");
        Ok(())
    }
}

/// Periodic driver owned by the run: emits beats and evicts silent peers.
/// Exits when the run begins draining. Silence checks run on their own,
/// faster cadence so a short eviction timeout works under a long beat
/// interval.
pub(crate) async fn heartbeat_driver(cluster: Arc<Cluster>, mut run_drain: watch::Receiver<bool>) {
    let timeout = cluster.config().heartbeat_timeout;
    let mut beat = tokio::time::interval(cluster.config().heartbeat_interval);
    beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let check_every = (timeout / 4).max(std::time::Duration::from_millis(25));
    let mut check = tokio::time::interval(check_every);
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = run_drain.wait_for(|draining| *draining) => return,
            _ = beat.tick() => emit_beats(&cluster),
            _ = check.tick() => evict_silent(&cluster, timeout),
        }
    }
}

fn emit_beats(cluster: &Arc<Cluster>) {
    let snapshot = cluster.connections_snapshot();
    for slot in snapshot.values() {
        if slot.connection.is_loopback() {
            continue;
        }
        // Each beat goes out on its own task with its own borrow, so a peer
        // with a full send buffer cannot stall the driver or the other
        // connections.
        let Some((conn, lock)) = cluster.get_connection(&slot.connection.peer_id()) else {
            continue;
        };
        tokio::spawn(async move {
            let _keepalive = lock;
            if let Err(err) = conn.send_framed(HEARTBEAT_TAG, &[]).await {
                trace!(peer_id = %conn.peer_id(), error = %err, "heartbeat send failed");
                conn.kill();
            }
        });
    }
}

fn evict_silent(cluster: &Arc<Cluster>, timeout: std::time::Duration) {
    let snapshot = cluster.connections_snapshot();
    for slot in snapshot.values() {
        let conn = &slot.connection;
        if conn.is_loopback() {
            continue;
        }
        let idle = conn.idle_for();
        if idle > timeout {
            debug!(
                peer_id = %conn.peer_id(),
                idle_ms = idle.as_millis() as u64,
                "peer silent past heartbeat timeout, evicting"
            );
            conn.kill();
        }
    }
}
