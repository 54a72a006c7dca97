//! Node discovery service
//!
//! Runs the UDP discovery protocol on top of the pure [`RoutingTable`]:
//! verifies candidates with PING/PONG, answers neighbour queries, keeps the
//! ban list and walks the network on bootstrap and on a refresh timer.

use super::ban_list::BanList;
use super::message::{
    self, expiration_from_now, unix_now, FindNeighbours, Message, Neighbours, PacketError, Ping,
    Pong, DISCOVERY_VERSION, MAX_NEIGHBOURS_PER_PACKET, MAX_PACKET_SIZE,
};
use crate::crypto::{KeyPair, NodeId};
use crate::routing::{distance, AddOutcome, Endpoint, PeerRecord, RoutingTable, BUCKET_SIZE};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Capacity of the event channel
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Floor for the refresh timer; `interval` panics on zero
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Discovery service errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Timeout error: {request} {addr}")]
    Timeout {
        request: &'static str,
        addr: SocketAddr,
    },
    #[error("Peer is banned: {0}")]
    Banned(String),
    #[error("Refusing to add the local node")]
    SelfConnection,
    #[error("Discovery socket is not bound")]
    NotBound,
    #[error("Discovery service closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

impl DiscoveryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DiscoveryError::Timeout { .. })
    }
}

/// Notifications published by the discovery service
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Socket bound
    Listening(SocketAddr),
    /// Service destroyed
    Closed,
    /// Socket or packet error; the service keeps running
    Error(String),
    /// A candidate answered our ping for the first time
    PeerNew(PeerRecord),
    /// A record entered the routing table
    PeerAdded(PeerRecord),
    /// A record left the routing table
    PeerRemoved(PeerRecord),
}

/// Discovery service configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP address to bind
    pub bind_addr: SocketAddr,
    /// Address announced in outgoing pings; the bound address when `None`
    pub advertised_address: Option<IpAddr>,
    /// TCP port announced to peers, `None` for outbound-only nodes
    pub tcp_port: Option<u16>,
    /// How long to wait for PONG / NEIGHBOURS
    pub timeout: Duration,
    /// Interval between background refresh walks
    pub refresh_interval: Duration,
    /// Ban applied to peers that fail to answer a ping
    pub ban_duration: Duration,
    /// Hop limit for iterative lookups
    pub max_lookup_hops: usize,
    /// Concurrent FINDNEIGHBOURS queries per hop
    pub lookup_parallelism: usize,
    /// Bucket capacity (k)
    pub bucket_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 30303),
            advertised_address: None,
            tcp_port: Some(30303),
            timeout: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(60),
            ban_duration: Duration::from_secs(5 * 60),
            max_lookup_hops: 8,
            lookup_parallelism: 3,
            bucket_size: BUCKET_SIZE,
        }
    }
}

struct State {
    table: RoutingTable,
    bans: BanList,
    socket: Option<Arc<UdpSocket>>,
    local_addr: Option<SocketAddr>,
    /// Outstanding pings keyed by packet hash
    pending_pings: HashMap<[u8; 32], oneshot::Sender<NodeId>>,
    /// Outstanding neighbour queries, at most one per queried node
    pending_neighbours: HashMap<NodeId, NeighbourQuery>,
    closed: bool,
}

type NeighboursWaiter = oneshot::Sender<Vec<(NodeId, Endpoint)>>;

/// A FINDNEIGHBOURS in flight. NEIGHBOURS replies carry no target, so a
/// node is only ever asked about one target at a time.
struct NeighbourQuery {
    target: NodeId,
    waiters: Vec<NeighboursWaiter>,
}

impl State {
    /// Drop waiters that gave up; forget the query once none are left
    fn prune_neighbour_waiters(&mut self, id: &NodeId) {
        if let Some(query) = self.pending_neighbours.get_mut(id) {
            query.waiters.retain(|tx| !tx.is_closed());
            if query.waiters.is_empty() {
                self.pending_neighbours.remove(id);
            }
        }
    }
}

enum QuerySlot {
    /// We own the query and must send it
    Send(Arc<UdpSocket>),
    /// Same target already asked; share its answer
    Join,
    /// Another target is being asked; retry once it settles
    Wait,
}

struct Inner {
    key: KeyPair,
    id: NodeId,
    config: DiscoveryConfig,
    state: Mutex<State>,
    events: broadcast::Sender<DiscoveryEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a discovery service instance
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<Inner>,
}

impl Discovery {
    /// Create an unbound service; call [`Discovery::bind`] to start it
    pub fn new(key: KeyPair, config: DiscoveryConfig) -> Self {
        let id = key.node_id();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let state = State {
            table: RoutingTable::with_bucket_size(id, config.bucket_size),
            bans: BanList::new(),
            socket: None,
            local_addr: None,
            pending_pings: HashMap::new(),
            pending_neighbours: HashMap::new(),
            closed: false,
        };

        Self {
            inner: Arc::new(Inner {
                key,
                id,
                config,
                state: Mutex::new(state),
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bind the UDP socket and start the receive loop and refresh timer
    pub async fn bind(&self) -> Result<SocketAddr, DiscoveryError> {
        let socket = Arc::new(UdpSocket::bind(self.inner.config.bind_addr).await?);
        let local_addr = socket.local_addr()?;

        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(DiscoveryError::Closed);
            }
            state.socket = Some(socket.clone());
            state.local_addr = Some(local_addr);
        }

        let receiver = tokio::spawn(self.clone().run_receiver(socket));
        let refresher = tokio::spawn(self.clone().run_refresh());
        self.inner.tasks.lock().await.extend([receiver, refresher]);

        log::info!("Discovery listening on {} as {}", local_addr, self.inner.id);
        self.emit(DiscoveryEvent::Listening(local_addr));
        Ok(local_addr)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn key(&self) -> &KeyPair {
        &self.inner.key
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    /// Subscribe to discovery notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().await.local_addr
    }

    /// Endpoint this node announces in pings
    pub async fn local_endpoint(&self) -> Endpoint {
        let local_addr = self.local_addr().await;
        let config = &self.inner.config;
        let address = config
            .advertised_address
            .or_else(|| local_addr.map(|a| a.ip()))
            .unwrap_or(config.bind_addr.ip());
        let udp_port = local_addr.map(|a| a.port()).unwrap_or(config.bind_addr.port());
        Endpoint::new(address, udp_port, config.tcp_port)
    }

    /// All records in the routing table
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.inner.state.lock().await.table.peers()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.state.lock().await.table.len()
    }

    pub async fn get_peer(&self, id: &NodeId) -> Option<PeerRecord> {
        self.inner.state.lock().await.table.get(id).cloned()
    }

    pub async fn closest(&self, target: &NodeId, n: usize) -> Vec<PeerRecord> {
        self.inner.state.lock().await.table.closest(target, n)
    }

    /// Whether `id` is currently banned
    pub async fn is_banned(&self, id: &NodeId) -> bool {
        self.inner.state.lock().await.bans.is_banned(*id)
    }

    /// Verify an endpoint with a ping and add it to the table
    pub async fn add_peer(&self, endpoint: Endpoint) -> Result<PeerRecord, DiscoveryError> {
        self.add_candidate(endpoint, None).await
    }

    /// Remove a record from the table
    pub async fn remove_peer(&self, id: &NodeId) -> Option<PeerRecord> {
        let removed = self.inner.state.lock().await.table.remove(id);
        if let Some(record) = &removed {
            log::debug!("Removed peer {} ({})", record.id, record.endpoint);
            self.emit(DiscoveryEvent::PeerRemoved(record.clone()));
        }
        removed
    }

    /// Ban an id (and its address, when known) and drop it from the table
    pub async fn ban_peer(&self, id: &NodeId, duration: Duration) {
        let removed = {
            let mut state = self.inner.state.lock().await;
            state.bans.ban(*id, duration);
            let removed = state.table.remove(id);
            if let Some(record) = &removed {
                state.bans.ban(record.endpoint.udp_addr(), duration);
            }
            removed
        };

        log::info!("Banned peer {} for {:?}", id, duration);
        if let Some(record) = removed {
            self.emit(DiscoveryEvent::PeerRemoved(record));
        }
    }

    /// Ping the seed and walk toward our own id from it
    pub async fn bootstrap(&self, seed: Endpoint) -> Result<(), DiscoveryError> {
        let record = self.add_peer(seed).await.map_err(|e| {
            log::debug!("Bootstrap with {} failed: {}", seed, e);
            e
        })?;
        log::info!("Bootstrapping from {} ({})", record.id, record.endpoint);
        self.lookup(self.inner.id).await;
        Ok(())
    }

    /// Walk toward a random target to discover new peers
    pub async fn refresh(&self) {
        let target = NodeId::random();
        log::debug!("Refreshing routing table ({} peers)", self.peer_count().await);
        self.lookup(target).await;
    }

    /// Ping each `old` record; evict the unresponsive ones in favour of
    /// `candidate`. Responsive records are left untouched.
    pub async fn check_liveness(&self, old: Vec<PeerRecord>, candidate: PeerRecord) {
        if self.inner.state.lock().await.bans.is_banned(candidate.id) {
            return;
        }

        for peer in old {
            match self.ping(peer.endpoint).await {
                Ok(id) if id == peer.id => continue,
                Ok(id) => log::debug!("{} answered as {} instead of {}", peer.endpoint, id, peer.id),
                Err(e) => log::debug!("Liveness check of {} failed: {}", peer.id, e),
            }

            let ban_duration = self.inner.config.ban_duration;
            let (removed, outcome) = {
                let mut state = self.inner.state.lock().await;
                state.bans.ban(peer.id, ban_duration);
                state.bans.ban(peer.endpoint.udp_addr(), ban_duration);
                let removed = state.table.remove(&peer.id);
                (removed, state.table.add(candidate.clone()))
            };

            if let Some(record) = removed {
                self.emit(DiscoveryEvent::PeerRemoved(record));
            }
            if outcome == AddOutcome::Inserted {
                self.emit(DiscoveryEvent::PeerAdded(candidate.clone()));
            }
        }
    }

    /// Stop the service: close the socket, cancel timers, settle requests
    pub async fn destroy(&self) {
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }

        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.socket = None;
            // Dropping the senders fails every waiter with `Closed`
            state.pending_pings.clear();
            state.pending_neighbours.clear();
        }

        log::info!("Discovery {} closed", self.inner.id);
        self.emit(DiscoveryEvent::Closed);
    }

    // =========================================================================
    // Candidate verification
    // =========================================================================

    async fn add_candidate(
        &self,
        endpoint: Endpoint,
        id: Option<NodeId>,
    ) -> Result<PeerRecord, DiscoveryError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(DiscoveryError::Closed);
            }
            if state.bans.is_banned(endpoint.udp_addr()) {
                return Err(DiscoveryError::Banned(endpoint.to_string()));
            }
            if let Some(id) = id {
                if id == self.inner.id {
                    return Err(DiscoveryError::SelfConnection);
                }
                if state.bans.is_banned(id) {
                    return Err(DiscoveryError::Banned(id.to_string()));
                }
                if let Some(existing) = state.table.get(&id) {
                    return Ok(existing.clone());
                }
            }
        }

        let id = match self.ping(endpoint).await {
            Ok(id) => id,
            Err(e) => {
                if e.is_timeout() {
                    self.inner
                        .state
                        .lock()
                        .await
                        .bans
                        .ban(endpoint.udp_addr(), self.inner.config.ban_duration);
                }
                return Err(e);
            }
        };

        let record = PeerRecord::new(id, endpoint);
        let outcome = {
            let mut state = self.inner.state.lock().await;
            if id == self.inner.id {
                return Err(DiscoveryError::SelfConnection);
            }
            if state.bans.is_banned(id) {
                return Err(DiscoveryError::Banned(id.to_string()));
            }
            state.table.add(record.clone())
        };

        match outcome {
            AddOutcome::Inserted => {
                self.emit(DiscoveryEvent::PeerNew(record.clone()));
                log::debug!("Added peer {} ({})", record.id, record.endpoint);
                self.emit(DiscoveryEvent::PeerAdded(record.clone()));
            }
            AddOutcome::Full { oldest } => {
                self.emit(DiscoveryEvent::PeerNew(record.clone()));
                let this = self.clone();
                let candidate = record.clone();
                tokio::spawn(async move { this.check_liveness(vec![oldest], candidate).await });
            }
            AddOutcome::Updated | AddOutcome::Rejected => {}
        }
        Ok(record)
    }

    fn spawn_add_candidate(&self, endpoint: Endpoint, id: Option<NodeId>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.add_candidate(endpoint, id).await {
                log::trace!("Candidate {} not added: {}", endpoint, e);
            }
        });
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Ping an endpoint, resolving with the id that answered
    async fn ping(&self, endpoint: Endpoint) -> Result<NodeId, DiscoveryError> {
        let ping = Message::Ping(Ping {
            version: DISCOVERY_VERSION,
            from: self.local_endpoint().await,
            to: endpoint,
            expiration: expiration_from_now(),
        });
        let (bytes, hash) = message::encode(&ping, &self.inner.key)?;

        let (tx, rx) = oneshot::channel();
        let socket = {
            let mut state = self.inner.state.lock().await;
            let socket = Self::bound_socket(&state)?;
            state.pending_pings.insert(hash, tx);
            socket
        };

        let addr = endpoint.udp_addr();
        if let Err(e) = socket.send_to(&bytes, addr).await {
            self.inner.state.lock().await.pending_pings.remove(&hash);
            return Err(e.into());
        }
        log::trace!("Sent PING to {}", addr);

        match tokio::time::timeout(self.inner.config.timeout, rx).await {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(_)) => Err(DiscoveryError::Closed),
            Err(_) => {
                self.inner.state.lock().await.pending_pings.remove(&hash);
                Err(DiscoveryError::Timeout {
                    request: "ping",
                    addr,
                })
            }
        }
    }

    /// Ask `peer` for the records closest to `target`
    async fn find_neighbours(
        &self,
        peer: &PeerRecord,
        target: NodeId,
    ) -> Result<Vec<(NodeId, Endpoint)>, DiscoveryError> {
        let addr = peer.endpoint.udp_addr();
        let timeout = self.inner.config.timeout;

        loop {
            let (tx, rx) = oneshot::channel();
            let slot = {
                let mut state = self.inner.state.lock().await;
                let socket = Self::bound_socket(&state)?;
                match state.pending_neighbours.get_mut(&peer.id) {
                    Some(query) => {
                        let slot = if query.target == target {
                            QuerySlot::Join
                        } else {
                            QuerySlot::Wait
                        };
                        query.waiters.push(tx);
                        slot
                    }
                    None => {
                        state.pending_neighbours.insert(
                            peer.id,
                            NeighbourQuery {
                                target,
                                waiters: vec![tx],
                            },
                        );
                        QuerySlot::Send(socket)
                    }
                }
            };

            let result = match slot {
                QuerySlot::Wait => {
                    let _ = tokio::time::timeout(timeout, rx).await;
                    self.inner
                        .state
                        .lock()
                        .await
                        .prune_neighbour_waiters(&peer.id);
                    continue;
                }
                QuerySlot::Join => Self::await_neighbours(rx, timeout, addr).await,
                QuerySlot::Send(socket) => {
                    let request = Message::FindNeighbours(FindNeighbours {
                        target,
                        expiration: expiration_from_now(),
                    });
                    match message::encode(&request, &self.inner.key) {
                        Ok((bytes, _)) => match socket.send_to(&bytes, addr).await {
                            Ok(_) => Self::await_neighbours(rx, timeout, addr).await,
                            Err(e) => {
                                drop(rx);
                                Err(e.into())
                            }
                        },
                        Err(e) => {
                            drop(rx);
                            Err(e.into())
                        }
                    }
                }
            };

            if result.is_err() {
                self.inner
                    .state
                    .lock()
                    .await
                    .prune_neighbour_waiters(&peer.id);
            }
            return result;
        }
    }

    async fn await_neighbours(
        rx: oneshot::Receiver<Vec<(NodeId, Endpoint)>>,
        timeout: Duration,
        addr: SocketAddr,
    ) -> Result<Vec<(NodeId, Endpoint)>, DiscoveryError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(nodes)) => Ok(nodes),
            Ok(Err(_)) => Err(DiscoveryError::Closed),
            Err(_) => Err(DiscoveryError::Timeout {
                request: "findneighbours",
                addr,
            }),
        }
    }

    /// Iterative FINDNEIGHBOURS walk toward `target`
    ///
    /// Each hop queries the closest unqueried records, verifies every
    /// returned node with a ping, and stops once a hop brings nothing closer
    /// than the best distance seen so far.
    async fn lookup(&self, target: NodeId) {
        let config = &self.inner.config;
        let target_hash = target.hash();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut best = None;

        for hop in 0..config.max_lookup_hops {
            let candidates: Vec<PeerRecord> = {
                let state = self.inner.state.lock().await;
                if state.closed {
                    return;
                }
                state
                    .table
                    .closest(&target, config.bucket_size)
                    .into_iter()
                    .filter(|p| !queried.contains(&p.id))
                    .take(config.lookup_parallelism.max(1))
                    .collect()
            };
            if candidates.is_empty() {
                break;
            }

            for peer in &candidates {
                queried.insert(peer.id);
                let d = distance(&peer.id.hash(), &target_hash);
                if best.map_or(true, |b| d < b) {
                    best = Some(d);
                }
            }

            let responses = join_all(
                candidates
                    .iter()
                    .map(|peer| self.find_neighbours(peer, target)),
            )
            .await;

            let mut found: HashMap<NodeId, Endpoint> = HashMap::new();
            for (peer, response) in candidates.iter().zip(responses) {
                match response {
                    Ok(nodes) => found.extend(nodes.into_iter().filter(|(id, _)| *id != self.inner.id)),
                    Err(e) => log::debug!("FINDNEIGHBOURS to {} failed: {}", peer.endpoint, e),
                }
            }

            let mut improved = false;
            for id in found.keys() {
                let d = distance(&id.hash(), &target_hash);
                if best.map_or(true, |b| d < b) {
                    best = Some(d);
                    improved = true;
                }
            }

            // Failures are per candidate and never abort the walk
            let results = join_all(
                found
                    .into_iter()
                    .map(|(id, endpoint)| self.add_candidate(endpoint, Some(id))),
            )
            .await;
            let verified = results.iter().filter(|r| r.is_ok()).count();
            log::trace!("Lookup hop {}: {} neighbours verified", hop, verified);

            if !improved {
                break;
            }
        }
    }

    // =========================================================================
    // Inbound packets
    // =========================================================================

    async fn run_receiver(self, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE * 2];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => self.handle_packet(&buf[..len], from).await,
                Err(e) => {
                    log::warn!("Discovery socket error: {}", e);
                    self.emit(DiscoveryEvent::Error(e.to_string()));
                }
            }
        }
    }

    async fn run_refresh(self) {
        let period = self.inner.config.refresh_interval.max(MIN_REFRESH_INTERVAL);
        let mut interval = tokio::time::interval(period);
        // The first tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.refresh().await;
        }
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        let packet = match message::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Invalid packet from {}: {}", from, e);
                self.emit(DiscoveryEvent::Error(format!("{}: {}", from, e)));
                return;
            }
        };

        if packet.message.is_expired(unix_now()) {
            log::debug!("Dropping expired {} from {}", packet.message.type_name(), from);
            return;
        }
        if packet.sender == self.inner.id {
            return;
        }
        {
            let mut state = self.inner.state.lock().await;
            if state.bans.is_banned(packet.sender) || state.bans.is_banned(from) {
                log::trace!("Dropping {} from banned {}", packet.message.type_name(), from);
                return;
            }
        }
        log::trace!("Received {} from {}", packet.message.type_name(), from);

        let sender = packet.sender;
        match packet.message {
            Message::Ping(ping) => {
                let remote = Endpoint::new(from.ip(), from.port(), ping.from.tcp_port);
                let pong = Message::Pong(Pong {
                    to: remote,
                    ping_hash: packet.hash,
                    expiration: expiration_from_now(),
                });
                self.send(&pong, from).await;
                self.spawn_add_candidate(remote, Some(sender));
            }
            Message::Pong(pong) => {
                let waiter = self.inner.state.lock().await.pending_pings.remove(&pong.ping_hash);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(sender);
                    }
                    None => log::trace!("Unsolicited PONG from {}", from),
                }
            }
            Message::FindNeighbours(find) => {
                let closest = self
                    .closest(&find.target, self.inner.config.bucket_size)
                    .await;
                let nodes: Vec<(NodeId, Endpoint)> =
                    closest.into_iter().map(|p| (p.id, p.endpoint)).collect();

                if nodes.is_empty() {
                    self.send_neighbours(Vec::new(), from).await;
                }
                for chunk in nodes.chunks(MAX_NEIGHBOURS_PER_PACKET) {
                    self.send_neighbours(chunk.to_vec(), from).await;
                }
            }
            Message::Neighbours(neighbours) => {
                let waiters = self
                    .inner
                    .state
                    .lock()
                    .await
                    .pending_neighbours
                    .remove(&sender)
                    .map(|query| query.waiters)
                    .unwrap_or_default();

                if waiters.is_empty() {
                    for (id, endpoint) in neighbours.nodes {
                        self.spawn_add_candidate(endpoint, Some(id));
                    }
                } else {
                    for tx in waiters {
                        let _ = tx.send(neighbours.nodes.clone());
                    }
                }
            }
        }
    }

    async fn send_neighbours(&self, nodes: Vec<(NodeId, Endpoint)>, to: SocketAddr) {
        let reply = Message::Neighbours(Neighbours {
            nodes,
            expiration: expiration_from_now(),
        });
        self.send(&reply, to).await;
    }

    /// Fire-and-forget send; failures are logged
    async fn send(&self, message: &Message, to: SocketAddr) {
        let socket = {
            let state = self.inner.state.lock().await;
            match Self::bound_socket(&state) {
                Ok(socket) => socket,
                Err(_) => return,
            }
        };

        let result = match message::encode(message, &self.inner.key) {
            Ok((bytes, _)) => socket.send_to(&bytes, to).await.map(|_| ()).map_err(Into::into),
            Err(e) => Err(DiscoveryError::from(e)),
        };
        if let Err(e) = result {
            log::warn!("Failed to send {} to {}: {}", message.type_name(), to, e);
        }
    }

    fn bound_socket(state: &State) -> Result<Arc<UdpSocket>, DiscoveryError> {
        if state.closed {
            return Err(DiscoveryError::Closed);
        }
        state.socket.clone().ok_or(DiscoveryError::NotBound)
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is not an error
        let _ = self.inner.events.send(event);
    }
}
