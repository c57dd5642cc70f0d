//! The run: the period during which a cluster is actually on the network.
//!
//! Constructing a [`Run`] binds the cluster listener, installs the loopback
//! connection, and starts accepting; dropping it (or calling
//! [`Run::shutdown`]) stops accepting, drains every connection it created,
//! and only then returns. Message handlers outlive the run, so no handler is
//! ever invoked for a connection after the run that created it has stopped.
//!
//! Every intra-cluster TCP stream, inbound or outbound, flows through
//! [`RunShared::establish`]: preamble validation, identity exchange, the
//! routing-table commit that resolves simultaneous-connect races, and then a
//! long-lived service task that reads frames until the connection dies.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::address::{HostPort, PeerAddress};
use crate::cluster::Cluster;
use crate::connection::Connection;
use crate::drain::{DrainLock, Drainer};
use crate::framing;
use crate::handshake::{self, Identify, RoutingGossip};
use crate::routing::{AttemptGuard, AttemptTable, RoutingEntry, RoutingTable};
use crate::{ClusterError, PeerId, Result};

/// What an outbound dial knows about the peer it is trying to reach.
#[derive(Debug, Clone)]
struct Expectation {
    /// Peer id hint from gossip or an explicit targeted join.
    expected: Option<PeerId>,
    /// When true, a different peer answering is a quiet failure rather than
    /// an acceptable surprise.
    required: bool,
    /// The address set the dial was launched against.
    dialed: PeerAddress,
}

/// Per-endpoint result of one dial attempt.
enum DialOutcome {
    /// Handshake completed and the connection is registered.
    Joined,
    /// The attempt resolved without a connection and without need for a
    /// retry: race lost, peer incompatible, endpoint already in flight.
    Settled,
    /// Transport-level failure; a later retry may succeed.
    Retry,
}

pub(crate) struct RunShared {
    cluster: Arc<Cluster>,
    routing: RoutingTable,
    attempts: AttemptTable,
    dial_gate: Arc<Semaphore>,
    canonical: PeerAddress,
    client_port: u16,
    drain_tx: watch::Sender<bool>,
    drainer: Drainer,
    closed: AtomicBool,
    /// Version-skew diagnostics are logged once per remote endpoint.
    skew_logged: DashMap<String, ()>,
}

/// A listening, connecting, message-carrying instance of a [`Cluster`].
/// At most one run exists per cluster at a time.
pub struct Run {
    shared: Arc<RunShared>,
    local_addrs: Vec<SocketAddr>,
    port: u16,
    loopback: Arc<Connection>,
    loopback_entry: Option<RoutingEntry>,
    tasks: Vec<JoinHandle<()>>,
}

impl Run {
    /// Bind the cluster listener, install the loopback connection, and start
    /// accepting. Fails only on socket-level problems; everything after
    /// construction is recovered per connection.
    pub async fn new(cluster: Arc<Cluster>) -> Result<Run> {
        if !cluster.try_claim_run() {
            return Err(ClusterError::InvalidConfig(
                "a run already exists for this cluster".to_string(),
            ));
        }

        match Self::start(cluster.clone()).await {
            Ok(run) => Ok(run),
            Err(err) => {
                cluster.release_run();
                Err(err)
            }
        }
    }

    async fn start(cluster: Arc<Cluster>) -> Result<Run> {
        let config = cluster.config().clone();

        let mut listeners = Vec::new();
        let mut local_addrs = Vec::new();
        let mut port = config.listen_port;
        for ip in &config.bind {
            let bind_addr = SocketAddr::new(*ip, port);
            let listener = TcpListener::bind(bind_addr).await.map_err(|err| {
                if err.kind() == std::io::ErrorKind::AddrInUse {
                    ClusterError::AddressInUse(bind_addr)
                } else {
                    ClusterError::Network(err)
                }
            })?;
            let actual = listener.local_addr()?;
            // An ephemeral request pins every subsequent bind to the port
            // the first listener got.
            port = actual.port();
            local_addrs.push(actual);
            listeners.push(listener);
        }
        if listeners.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "bind address set is empty".to_string(),
            ));
        }

        let canonical = if config.canonical.is_empty() {
            let endpoints = local_addrs
                .iter()
                .map(|addr| HostPort::from_ip(advertised_ip(addr.ip()), port))
                .collect();
            PeerAddress::new(endpoints)?
        } else {
            PeerAddress::new(config.canonical.clone())?
        };

        let (drain_tx, _) = watch::channel(false);
        let shared = Arc::new(RunShared {
            cluster: cluster.clone(),
            routing: RoutingTable::new(),
            attempts: AttemptTable::new(),
            dial_gate: Arc::new(Semaphore::new(config.dial_concurrency.max(1))),
            canonical: canonical.clone(),
            client_port: config.client_port,
            drain_tx,
            drainer: Drainer::new(),
            closed: AtomicBool::new(false),
            skew_logged: DashMap::new(),
        });

        // The loopback connection: registered before we start listening, so
        // the published view always contains ourselves while the run is up.
        let me = cluster.local_peer_id();
        let loopback = Connection::new(me, canonical.clone(), crate::ClusterVersion::CURRENT, None);
        let loopback_entry = shared
            .routing
            .try_add(me, canonical)
            .expect("fresh routing table rejected the loopback entry");
        cluster.registry().insert(loopback.clone())?;

        let mut tasks = Vec::new();
        for listener in listeners {
            let lock = shared
                .drainer
                .lock()
                .expect("fresh run drainer is not draining");
            let shared = shared.clone();
            tasks.push(tokio::spawn(async move {
                let _keepalive = lock;
                accept_loop(shared, listener).await;
            }));
        }

        let hb_lock = shared
            .drainer
            .lock()
            .expect("fresh run drainer is not draining");
        let hb_cluster = cluster.clone();
        let hb_drain = shared.drain_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let _keepalive = hb_lock;
            crate::heartbeat::heartbeat_driver(hb_cluster, hb_drain).await;
        }));

        info!(
            peer_id = %me,
            addrs = ?local_addrs,
            "cluster run started"
        );

        Ok(Run {
            shared,
            local_addrs,
            port,
            loopback,
            loopback_entry: Some(loopback_entry),
            tasks,
        })
    }

    /// Attach this node to the cluster reachable at `address`. Returns
    /// immediately; the dial runs in the background, retrying transport
    /// failures up to the configured cap. Protocol and version failures are
    /// final until the next explicit join.
    pub fn join(&self, address: PeerAddress) {
        self.shared.spawn_join(address, None, false);
    }

    /// Like [`join`](Self::join), but only a peer with exactly `expected`
    /// as its id is acceptable; anyone else answering fails the attempt
    /// quietly.
    pub fn join_peer(&self, address: PeerAddress, expected: PeerId) {
        self.shared.spawn_join(address, Some(expected), true);
    }

    /// IP addresses the cluster listener is bound on.
    pub fn ips(&self) -> Vec<IpAddr> {
        self.local_addrs.iter().map(|addr| addr.ip()).collect()
    }

    /// The actual cluster listen port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address set announced to peers.
    pub fn canonical_address(&self) -> &PeerAddress {
        &self.shared.canonical
    }

    /// Stop accepting, tear down every connection this run created, and wait
    /// for all of them to drain.
    pub async fn shutdown(mut self) {
        self.begin_close();

        // Kill every live peer connection; each service task deregisters,
        // drains, and releases its run keepalive. Collect plain references
        // first: holding the snapshot would itself block the drains.
        let peers: Vec<Arc<Connection>> = self
            .shared
            .cluster
            .registry()
            .snapshot()
            .values()
            .map(|slot| slot.connection.clone())
            .collect();
        for conn in peers {
            if !conn.is_loopback() {
                conn.kill();
            }
        }

        // The loopback connection has no service task; the run itself is
        // responsible for withdrawing it.
        let me = self.shared.cluster.local_peer_id();
        self.shared.cluster.registry().remove(&me);
        self.loopback.kill();
        self.loopback.drainer().drain().await;
        self.loopback_entry.take();

        self.shared.drainer.drain().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.shared.cluster.release_run();
        info!(peer_id = %me, "cluster run stopped");
    }

    fn begin_close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            info!("cluster run shutting down");
            self.shared.drain_tx.send_replace(true);
        }
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        // Best-effort teardown for a run dropped without shutdown(): signal
        // the drain, kill everything, and release the registry entries that
        // have no service task of their own.
        self.begin_close();
        let registry = self.shared.cluster.registry();
        let peers: Vec<Arc<Connection>> = registry
            .snapshot()
            .values()
            .map(|slot| slot.connection.clone())
            .collect();
        for conn in peers {
            conn.kill();
        }
        let me = self.shared.cluster.local_peer_id();
        registry.remove(&me);
        self.loopback_entry.take();
        self.shared.cluster.release_run();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let loopback = self.loopback.clone();
            handle.spawn(async move {
                loopback.drainer().drain().await;
            });
        }
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("addrs", &self.local_addrs)
            .field("port", &self.port)
            .finish()
    }
}

/// Pick the address to advertise for a bound IP: an unspecified bind has to
/// be replaced with something peers can actually dial.
fn advertised_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

impl RunShared {
    fn me(&self) -> PeerId {
        self.cluster.local_peer_id()
    }

    fn spawn_join(self: &Arc<Self>, address: PeerAddress, expected: Option<PeerId>, required: bool) {
        let Some(run_lock) = self.drainer.lock() else {
            return;
        };
        let shared = self.clone();
        tokio::spawn(async move {
            let _keepalive = run_lock;
            shared.join_task(address, expected, required).await;
        });
    }

    /// Background join: dial every endpoint of `address`, retrying transport
    /// failures with the configured interval, until the peer is reachable,
    /// the attempt settles, or the run drains.
    async fn join_task(self: Arc<Self>, address: PeerAddress, expected: Option<PeerId>, required: bool) {
        let config = self.cluster.config();
        let mut drain_rx = self.drain_tx.subscribe();

        for attempt in 1..=config.max_join_attempts {
            if let Some(peer) = expected {
                if self.routing.contains(&peer) {
                    return;
                }
            }

            match self.dial_round(&address, expected, required).await {
                DialOutcome::Joined | DialOutcome::Settled => return,
                DialOutcome::Retry => {}
            }

            if attempt == config.max_join_attempts {
                debug!(address = %address, attempts = attempt, "join abandoned");
                return;
            }

            // Jitter keeps two nodes that keep dialing each other from
            // colliding on every round.
            let jitter = {
                use rand::Rng;
                std::time::Duration::from_millis(rand::rng().random_range(0..250))
            };
            tokio::select! {
                _ = drain_rx.wait_for(|draining| *draining) => return,
                _ = tokio::time::sleep(config.join_retry_interval + jitter) => {}
            }
        }
    }

    /// One parallel dial across all endpoints of the target. The first
    /// attempt to complete a handshake wins; the shared flag short-circuits
    /// the rest.
    async fn dial_round(
        self: &Arc<Self>,
        address: &PeerAddress,
        expected: Option<PeerId>,
        required: bool,
    ) -> DialOutcome {
        let successful_join = Arc::new(AtomicBool::new(false));
        let mut attempts = Vec::new();
        for endpoint in address.iter() {
            // An endpoint already in the attempt table is being dialed (or
            // is carrying a live connection); repeating it is a no-op.
            let Some(guard) = self.attempts.reserve(endpoint.clone()) else {
                trace!(endpoint = %endpoint, "endpoint already in attempt table");
                continue;
            };
            let expectation = Expectation {
                expected,
                required,
                dialed: address.clone(),
            };
            attempts.push(self.clone().dial_endpoint(
                endpoint.clone(),
                expectation,
                successful_join.clone(),
                guard,
            ));
        }

        if attempts.is_empty() {
            return DialOutcome::Settled;
        }

        let outcomes = futures::future::join_all(attempts).await;
        let mut settled = false;
        let mut retry = false;
        for outcome in outcomes {
            match outcome {
                DialOutcome::Joined => return DialOutcome::Joined,
                DialOutcome::Settled => settled = true,
                DialOutcome::Retry => retry = true,
            }
        }
        if retry && !settled {
            DialOutcome::Retry
        } else {
            DialOutcome::Settled
        }
    }

    async fn dial_endpoint(
        self: Arc<Self>,
        endpoint: HostPort,
        expectation: Expectation,
        successful_join: Arc<AtomicBool>,
        attempt_guard: AttemptGuard,
    ) -> DialOutcome {
        let permit = match self.dial_gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return DialOutcome::Settled,
        };
        if successful_join.load(Ordering::SeqCst) || self.drainer.is_draining() {
            return DialOutcome::Settled;
        }

        let mut drain_rx = self.drain_tx.subscribe();
        let result = tokio::select! {
            _ = drain_rx.wait_for(|draining| *draining) => Err(ClusterError::Shutdown),
            result = self.connect_and_establish(&endpoint, &expectation, attempt_guard) => result,
        };
        drop(permit);

        match result {
            Ok(peer_id) => {
                successful_join.store(true, Ordering::SeqCst);
                debug!(endpoint = %endpoint, peer_id = %peer_id, "outbound join succeeded");
                DialOutcome::Joined
            }
            Err(ClusterError::RaceLost) => {
                trace!(endpoint = %endpoint, "outbound join lost the connection race");
                DialOutcome::Settled
            }
            Err(err @ (ClusterError::VersionSkew { .. }
            | ClusterError::ArchSkew { .. }
            | ClusterError::BuildModeSkew { .. })) => {
                self.log_skew_once(&endpoint.to_string(), &err);
                DialOutcome::Settled
            }
            Err(ClusterError::Shutdown) => DialOutcome::Settled,
            Err(err) if err.is_retryable() => {
                debug!(endpoint = %endpoint, error = %err, "dial attempt failed");
                DialOutcome::Retry
            }
            Err(err) => {
                debug!(endpoint = %endpoint, error = %err, "dial attempt rejected");
                DialOutcome::Settled
            }
        }
    }

    async fn connect_and_establish(
        self: &Arc<Self>,
        endpoint: &HostPort,
        expectation: &Expectation,
        attempt_guard: AttemptGuard,
    ) -> Result<PeerId> {
        let config = self.cluster.config();
        let addrs = endpoint.resolve().await?;

        let mut stream = None;
        let mut last_err = ClusterError::Network(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{endpoint} did not resolve"),
        ));
        for addr in addrs {
            match timeout(config.handshake_timeout, self.connect_once(addr)).await {
                Ok(Ok(connected)) => {
                    stream = Some(connected);
                    break;
                }
                Ok(Err(err)) => last_err = ClusterError::Network(err),
                Err(_) => last_err = ClusterError::Timeout,
            }
        }
        let Some(stream) = stream else {
            return Err(last_err);
        };

        self.establish(stream, Some(expectation.clone()), Some(attempt_guard))
            .await
    }

    /// Open one TCP stream, from the fixed client port when configured.
    async fn connect_once(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        if self.client_port == 0 {
            return TcpStream::connect(addr).await;
        }
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, self.client_port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, self.client_port).into()
        };
        socket.bind(local)?;
        socket.connect(addr).await
    }

    /// Take a fresh TCP stream through the whole handshake and, on success,
    /// hand it to a service task. Responsible for the preamble, the identity
    /// exchange, the routing-table commit that resolves simultaneous
    /// connects, and the join gossip that fans out afterwards.
    pub(crate) async fn establish(
        self: &Arc<Self>,
        stream: TcpStream,
        expectation: Option<Expectation>,
        attempt_guard: Option<AttemptGuard>,
    ) -> Result<PeerId> {
        let config = self.cluster.config().clone();
        let me = self.me();
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();

        let strict = config.strict_build_mode;
        let local_identify = Identify {
            peer_id: me,
            canonical: self.canonical.endpoints().to_vec(),
        };
        let preamble = async {
            handshake::write_preamble(&mut wr).await?;
            let outcome = handshake::read_preamble(&mut rd).await?;
            if !outcome.build_mode_matched {
                if strict {
                    return Err(ClusterError::BuildModeSkew {
                        ours: handshake::BUILD_MODE_STRING.to_string(),
                        theirs: outcome.peer_build_mode.clone(),
                    });
                }
                warn!(
                    peer_build_mode = %outcome.peer_build_mode,
                    "peer runs a different build mode"
                );
            }
            let remote = handshake::exchange_identify(&mut rd, &mut wr, &local_identify).await?;
            Ok((outcome.version, remote))
        };
        let (version, remote) = timeout(config.handshake_timeout, preamble)
            .await
            .map_err(|_| ClusterError::Timeout)??;

        let remote_id = remote.peer_id;
        if remote_id == me {
            // Dialed one of our own addresses; close without noise.
            return Err(ClusterError::RaceLost);
        }
        if let Some(exp) = &expectation {
            if exp.required {
                if let Some(want) = exp.expected {
                    if want != remote_id {
                        debug!(
                            expected = %want,
                            found = %remote_id,
                            "peer at dialed address has a different id"
                        );
                        return Err(ClusterError::RaceLost);
                    }
                }
            }
        }

        let remote_address = PeerAddress::new(remote.canonical)?;
        if let Some(exp) = &expectation {
            if exp.dialed != remote_address {
                trace!(
                    dialed = %exp.dialed,
                    announced = %remote_address,
                    "peer announces a different canonical address than dialed"
                );
            }
        }

        // The commit: insertion into the routing table is serialized, and
        // of two streams handshaking with the same peer only the first
        // insertion survives.
        let Some(routing_entry) = self.routing.try_add(remote_id, remote_address.clone()) else {
            return Err(ClusterError::RaceLost);
        };

        let Some(run_lock) = self.drainer.lock() else {
            return Err(ClusterError::Shutdown);
        };

        let gossip_out = RoutingGossip::from_snapshot(
            &self.routing.snapshot(),
            me,
            &self.canonical,
            remote_id,
        );
        let gossip_in = timeout(config.handshake_timeout, async {
            handshake::send_routing_gossip(&mut wr, &gossip_out).await?;
            handshake::read_routing_gossip(&mut rd).await
        })
        .await
        .map_err(|_| ClusterError::Timeout)??;

        let conn = Connection::new(remote_id, remote_address, version, Some(wr));
        self.cluster.registry().insert(conn.clone())?;

        // Close the race with a concurrent shutdown: the drain signal is
        // raised before the kill sweep, so a connection that registered too
        // late for the sweep still sees it here.
        if *self.drain_tx.borrow() {
            conn.kill();
        }

        // Join gossip: dial everyone the peer knows that we don't.
        for entry in gossip_in.entries {
            if entry.peer_id == me || self.routing.contains(&entry.peer_id) {
                continue;
            }
            match PeerAddress::new(entry.endpoints) {
                Ok(address) => {
                    trace!(peer_id = %entry.peer_id, address = %address, "gossip join");
                    self.spawn_join(address, Some(entry.peer_id), false);
                }
                Err(_) => {
                    debug!(peer_id = %entry.peer_id, "gossiped peer has no endpoints, skipping");
                }
            }
        }

        let shared = self.clone();
        tokio::spawn(serve_connection(
            shared,
            conn,
            rd,
            routing_entry,
            attempt_guard,
            run_lock,
        ));
        Ok(remote_id)
    }

    fn log_skew_once(&self, endpoint: &str, err: &ClusterError) {
        if self
            .skew_logged
            .insert(endpoint.to_string(), ())
            .is_none()
        {
            warn!(endpoint = %endpoint, error = %err, "incompatible peer");
        } else {
            trace!(endpoint = %endpoint, error = %err, "incompatible peer (repeat)");
        }
    }
}

async fn accept_loop(shared: Arc<RunShared>, listener: TcpListener) {
    let mut drain_rx = shared.drain_tx.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = drain_rx.wait_for(|draining| *draining) => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                trace!(remote = %remote, "inbound cluster connection");
                let Some(run_lock) = shared.drainer.lock() else {
                    return;
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    let _keepalive = run_lock;
                    match shared.establish(stream, None, None).await {
                        Ok(_) => {}
                        Err(ClusterError::RaceLost) => {
                            trace!(remote = %remote, "inbound connection lost the race");
                        }
                        Err(err @ (ClusterError::VersionSkew { .. }
                        | ClusterError::ArchSkew { .. }
                        | ClusterError::BuildModeSkew { .. })) => {
                            shared.log_skew_once(&remote.ip().to_string(), &err);
                        }
                        Err(err) => {
                            debug!(remote = %remote, error = %err, "inbound handshake failed");
                        }
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Owns one established connection for its whole life: reads frames,
/// dispatches them, and on any exit path deregisters, drains, and releases
/// the routing and attempt entries.
async fn serve_connection(
    shared: Arc<RunShared>,
    conn: Arc<Connection>,
    mut rd: OwnedReadHalf,
    routing_entry: RoutingEntry,
    attempt_guard: Option<AttemptGuard>,
    run_lock: DrainLock,
) {
    let peer_id = conn.peer_id();
    info!(
        peer_id = %peer_id,
        address = %conn.peer_address(),
        "connection established"
    );

    match read_loop(&shared, &conn, &mut rd).await {
        Ok(()) => debug!(peer_id = %peer_id, "connection closed"),
        Err(err) => debug!(peer_id = %peer_id, error = %err, "connection failed"),
    }

    // Teardown is top-down: withdraw from the registry first, then close
    // the stream, then wait out every outstanding borrow. Only after the
    // drain signal has fired do the routing and attempt entries go away,
    // so a reconnect is strictly sequenced after the old connection's
    // removal.
    conn.kill();
    shared.cluster.registry().remove(&peer_id);
    conn.shutdown_stream().await;
    conn.drainer().drain().await;
    drop(routing_entry);
    drop(attempt_guard);
    drop(run_lock);
    info!(peer_id = %peer_id, "connection drained");
}

async fn read_loop(
    shared: &Arc<RunShared>,
    conn: &Arc<Connection>,
    rd: &mut OwnedReadHalf,
) -> Result<()> {
    let max_payload = shared.cluster.config().max_message_size;
    let version = conn.negotiated_version();
    let mut kill_rx = conn.kill_signal();

    loop {
        let frame = tokio::select! {
            biased;
            _ = kill_rx.wait_for(|killed| *killed) => return Ok(()),
            frame = framing::read_frame(rd, max_payload) => frame?,
        };
        let Some((tag, payload)) = frame else {
            return Ok(()); // peer closed cleanly
        };
        conn.note_frame_received(payload.len());

        let Some(handler) = shared.cluster.handlers().get(tag) else {
            return Err(ClusterError::HandlerMissing(tag));
        };
        let Some(keepalive) = conn.drainer().lock() else {
            return Ok(()); // teardown has begun
        };
        // The handler runs to completion before the next frame is read;
        // handlers needing concurrency dispatch internally.
        handler.on_message(conn, keepalive, version, &payload)?;
    }
}
