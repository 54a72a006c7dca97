//! RLPx connection manager
//!
//! Owns the TCP listener and every session. Responsibilities:
//! - a slot budget: live sessions plus in-flight handshakes never exceed
//!   `max_peers`
//! - a dial queue fed by discovery, refilled on a timer and whenever a slot
//!   frees up, with back-off for peers that were full or unreachable
//! - admission of a remote HELLO (identity, version, capabilities, bans)

use super::codec::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
use super::ecies::{HandshakeError, Secrets};
use super::message::{negotiate, Capability, DisconnectReason, Hello, MIN_PROTOCOL_VERSION};
use super::session::{self, Direction, Peer, Session};
use crate::crypto::{KeyPair, NodeId};
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::sec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const EVENT_CHANNEL_SIZE: usize = 1024;

/// Floor for the refill timer
const MIN_REFILL_INTERVAL: Duration = Duration::from_millis(10);

/// RLPx errors
#[derive(Error, Debug)]
pub enum RlpxError {
    #[error("Already connected to {0}")]
    AlreadyConnected(NodeId),
    #[error("No free peer slots")]
    TooManyPeers,
    #[error("Peer is banned: {0}")]
    Banned(NodeId),
    #[error("Refusing to connect to the local node")]
    SelfConnection,
    #[error("Connection to {0} timed out")]
    Timeout(SocketAddr),
    #[error("RLPx closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Notifications published by the manager
#[derive(Debug, Clone)]
pub enum RlpxEvent {
    Listening(SocketAddr),
    Closed,
    Error(String),
    /// HELLO accepted; the session is live
    PeerAdded(Peer),
    /// Session ended
    PeerRemoved {
        peer: Peer,
        reason: DisconnectReason,
        locally_initiated: bool,
    },
    /// A session hit a protocol error and is being disconnected
    PeerError { peer: Peer, error: String },
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct RlpxConfig {
    /// Upper bound on sessions plus in-flight handshakes
    pub max_peers: usize,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    /// Port advertised in HELLO when not listening
    pub listen_port: Option<u16>,
    /// Remotes whose client id contains one of these are rejected
    pub client_filter: Vec<String>,
    pub dial_timeout: Duration,
    /// Bound on the crypto handshake and on the HELLO exchange
    pub hello_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub refill_interval: Duration,
    /// Delay before redialling a peer that was full or unreachable
    pub retry_backoff: Duration,
    pub status_timeout: Duration,
    pub chunk_size: usize,
    pub max_message_size: usize,
}

impl Default for RlpxConfig {
    fn default() -> Self {
        Self {
            max_peers: 10,
            client_id: format!("sec-p2p/v{}", env!("CARGO_PKG_VERSION")),
            capabilities: sec::capabilities(),
            listen_port: None,
            client_filter: Vec::new(),
            dial_timeout: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(10),
            refill_interval: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(300),
            status_timeout: sec::STATUS_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

struct QueueEntry {
    id: NodeId,
    addr: SocketAddr,
    not_before: Instant,
}

struct State {
    sessions: HashMap<NodeId, Peer>,
    /// Outbound dials not yet admitted
    dialing: HashSet<NodeId>,
    /// Handshakes holding a slot, in either direction
    handshaking: usize,
    queue: VecDeque<QueueEntry>,
    listen_addr: Option<SocketAddr>,
    closed: bool,
}

impl State {
    fn open_slots(&self, max_peers: usize) -> usize {
        max_peers.saturating_sub(self.sessions.len() + self.handshaking)
    }

    fn release_dial(&mut self, id: &NodeId) {
        self.handshaking = self.handshaking.saturating_sub(1);
        self.dialing.remove(id);
    }
}

struct Inner {
    key: KeyPair,
    id: NodeId,
    config: RlpxConfig,
    discovery: Option<Discovery>,
    state: Mutex<State>,
    events: broadcast::Sender<RlpxEvent>,
    refill: Notify,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Handle to the RLPx transport
#[derive(Clone)]
pub struct Rlpx {
    inner: Arc<Inner>,
}

impl Rlpx {
    /// Create the manager and start its refill timer. With `discovery`
    /// set, newly verified peers are queued for dialling and banned
    /// identities are refused. Must be called from within a tokio runtime.
    pub fn new(key: KeyPair, config: RlpxConfig, discovery: Option<Discovery>) -> Self {
        let id = key.node_id();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let discovery_events = discovery.as_ref().map(|d| d.subscribe());

        let rlpx = Self {
            inner: Arc::new(Inner {
                key,
                id,
                config,
                discovery,
                state: Mutex::new(State {
                    sessions: HashMap::new(),
                    dialing: HashSet::new(),
                    handshaking: 0,
                    queue: VecDeque::new(),
                    listen_addr: None,
                    closed: false,
                }),
                events,
                refill: Notify::new(),
                tasks: StdMutex::new(Vec::new()),
            }),
        };

        rlpx.track(tokio::spawn(rlpx.clone().run_refill()));
        if let Some(events) = discovery_events {
            rlpx.track(tokio::spawn(rlpx.clone().watch_discovery(events)));
        }
        rlpx
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn config(&self) -> &RlpxConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RlpxEvent> {
        self.inner.events.subscribe()
    }

    /// Accept inbound connections on `addr`
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, RlpxError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(RlpxError::Closed);
            }
            state.listen_addr = Some(local_addr);
        }

        self.track(tokio::spawn(self.clone().accept_loop(listener)));
        log::info!("RLPx listening on {} as {}", local_addr, self.inner.id);
        self.emit(RlpxEvent::Listening(local_addr));
        Ok(local_addr)
    }

    /// Port advertised in our HELLO
    pub async fn listen_port(&self) -> u16 {
        let state = self.inner.state.lock().await;
        state
            .listen_addr
            .map(|addr| addr.port())
            .or(self.inner.config.listen_port)
            .unwrap_or(0)
    }

    /// Slots left for new sessions
    pub async fn open_slots(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.open_slots(self.inner.config.max_peers)
    }

    /// Live sessions
    pub async fn peers(&self) -> Vec<Peer> {
        let state = self.inner.state.lock().await;
        state.sessions.values().cloned().collect()
    }

    pub async fn get_peer(&self, id: &NodeId) -> Option<Peer> {
        self.inner.state.lock().await.sessions.get(id).cloned()
    }

    /// Number of peers waiting in the dial queue
    pub async fn queued(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Dial a node now. Returns once the crypto handshake has completed;
    /// admission is reported through [`RlpxEvent::PeerAdded`].
    pub async fn connect(&self, id: NodeId, addr: SocketAddr) -> Result<(), RlpxError> {
        if id == self.inner.id {
            return Err(RlpxError::SelfConnection);
        }
        if self.is_banned(&id).await {
            return Err(RlpxError::Banned(id));
        }

        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(RlpxError::Closed);
            }
            if state.sessions.contains_key(&id) || state.dialing.contains(&id) {
                return Err(RlpxError::AlreadyConnected(id));
            }
            if state.open_slots(self.inner.config.max_peers) == 0 {
                return Err(RlpxError::TooManyPeers);
            }
            state.dialing.insert(id);
            state.handshaking += 1;
        }

        self.dial(id, addr, false).await
    }

    /// Disconnect a live session with CLIENT_QUITTING; false if there is none
    pub async fn disconnect(&self, id: &NodeId) -> bool {
        match self.get_peer(id).await {
            Some(peer) => {
                peer.disconnect(DisconnectReason::ClientQuitting);
                true
            }
            None => false,
        }
    }

    /// Stop listening and dialling and disconnect every session with
    /// CLIENT_QUITTING
    pub async fn destroy(&self) {
        let peers: Vec<Peer> = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.clear();
            state.sessions.values().cloned().collect()
        };

        // Background loops and in-flight dials
        let tasks = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }

        for peer in peers {
            peer.disconnect(DisconnectReason::ClientQuitting);
        }
        log::info!("RLPx {} closed", self.inner.id);
        self.emit(RlpxEvent::Closed);
    }

    // =========================================================================
    // Session callbacks
    // =========================================================================

    /// Validate a remote HELLO and register the session
    pub(crate) async fn admit(&self, peer: &Peer, hello: Hello) -> Result<(), DisconnectReason> {
        let config = &self.inner.config;
        let id = peer.id();

        if hello.protocol_version < MIN_PROTOCOL_VERSION {
            return Err(DisconnectReason::IncompatibleVersion);
        }
        if hello.id.is_zero() {
            return Err(DisconnectReason::NullNodeIdentity);
        }
        if hello.id != id {
            return Err(DisconnectReason::UnexpectedIdentity);
        }
        if id == self.inner.id {
            return Err(DisconnectReason::SameIdentity);
        }
        if self.inner.state.lock().await.sessions.contains_key(&id) {
            return Err(DisconnectReason::AlreadyConnected);
        }
        if self.is_banned(&id).await {
            log::debug!("Refusing banned peer {}", id);
            return Err(DisconnectReason::UselessPeer);
        }

        let client_id = hello.client_id.to_lowercase();
        if config
            .client_filter
            .iter()
            .any(|filter| client_id.contains(&filter.to_lowercase()))
        {
            log::debug!("Refusing filtered client {:?} ({})", hello.client_id, id);
            return Err(DisconnectReason::UselessPeer);
        }

        let shared = negotiate(&config.capabilities, &hello.capabilities);
        if shared.is_empty() {
            log::debug!("No shared capabilities with {}", id);
            return Err(DisconnectReason::UselessPeer);
        }

        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(DisconnectReason::ClientQuitting);
            }
            if state.sessions.contains_key(&id) {
                return Err(DisconnectReason::AlreadyConnected);
            }
            state.sessions.insert(id, peer.clone());
            state.handshaking = state.handshaking.saturating_sub(1);
            state.dialing.remove(&id);
            state.queue.retain(|entry| entry.id != id);
        }

        log::info!(
            "Peer connected: {} at {} ({:?}, {})",
            id,
            peer.addr(),
            peer.direction(),
            hello.client_id
        );
        peer.establish(hello, shared, config.status_timeout);
        self.emit(RlpxEvent::PeerAdded(peer.clone()));
        Ok(())
    }

    /// Release the session's slot and report its end
    pub(crate) async fn session_closed(
        &self,
        peer: &Peer,
        reason: DisconnectReason,
        locally_initiated: bool,
        holds_slot: bool,
    ) {
        let id = peer.id();
        let was_live = {
            let mut state = self.inner.state.lock().await;
            if holds_slot {
                state.handshaking = state.handshaking.saturating_sub(1);
                if peer.direction() == Direction::Outbound {
                    state.dialing.remove(&id);
                }
            }

            let was_live = state
                .sessions
                .get(&id)
                .is_some_and(|live| live.ptr_eq(peer));
            if was_live {
                state.sessions.remove(&id);
            }

            // A full remote is worth another try later
            if !state.closed
                && reason == DisconnectReason::TooManyPeers
                && !locally_initiated
                && peer.direction() == Direction::Outbound
                && !state.queue.iter().any(|entry| entry.id == id)
            {
                state.queue.push_back(QueueEntry {
                    id,
                    addr: peer.addr(),
                    not_before: Instant::now() + self.inner.config.retry_backoff,
                });
            }
            was_live
        };

        if was_live {
            log::info!("Peer disconnected: {} ({})", id, reason);
        } else {
            log::debug!("Session with {} ended before admission ({})", peer.addr(), reason);
        }
        self.emit(RlpxEvent::PeerRemoved {
            peer: peer.clone(),
            reason,
            locally_initiated,
        });
        self.inner.refill.notify_one();
    }

    pub(crate) fn peer_error(&self, peer: &Peer, error: String) {
        log::warn!("Protocol error from {}: {}", peer.id(), error);
        self.emit(RlpxEvent::PeerError {
            peer: peer.clone(),
            error,
        });
    }

    // =========================================================================
    // Dialling
    // =========================================================================

    /// Dial with a slot already reserved in `dialing` / `handshaking`
    async fn dial(&self, id: NodeId, addr: SocketAddr, from_queue: bool) -> Result<(), RlpxError> {
        log::debug!("Dialing {} at {}", id, addr);
        match self.open_outbound(id, addr).await {
            Ok((stream, secrets)) => {
                let session = Session::new(
                    self.clone(),
                    stream,
                    secrets,
                    addr,
                    Direction::Outbound,
                    true,
                );
                tokio::spawn(session.run(None));
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.inner.state.lock().await;
                    state.release_dial(&id);
                    // Handshake failures mean a wrong or hostile identity
                    let retry = !matches!(e, RlpxError::Handshake(_));
                    if from_queue && retry && !state.closed {
                        state.queue.push_back(QueueEntry {
                            id,
                            addr,
                            not_before: Instant::now() + self.inner.config.retry_backoff,
                        });
                    }
                }
                log::debug!("Failed to connect to {} at {}: {}", id, addr, e);
                self.inner.refill.notify_one();
                Err(e)
            }
        }
    }

    async fn open_outbound(
        &self,
        id: NodeId,
        addr: SocketAddr,
    ) -> Result<(TcpStream, Secrets), RlpxError> {
        let config = &self.inner.config;
        let mut stream = tokio::time::timeout(config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RlpxError::Timeout(addr))??;
        let secrets = tokio::time::timeout(
            config.hello_timeout,
            session::initiate(&mut stream, &self.inner.key, id),
        )
        .await
        .map_err(|_| RlpxError::Timeout(addr))??;
        Ok((stream, secrets))
    }

    /// Queue a discovered peer for dialling
    async fn enqueue(&self, id: NodeId, addr: SocketAddr) {
        if id == self.inner.id {
            return;
        }
        {
            let mut state = self.inner.state.lock().await;
            if state.closed
                || state.sessions.contains_key(&id)
                || state.dialing.contains(&id)
                || state.queue.iter().any(|entry| entry.id == id)
            {
                return;
            }
            state.queue.push_back(QueueEntry {
                id,
                addr,
                not_before: Instant::now(),
            });
        }
        log::trace!("Queued {} at {}", id, addr);
        self.inner.refill.notify_one();
    }

    async fn dequeue(&self, id: &NodeId) {
        let mut state = self.inner.state.lock().await;
        state.queue.retain(|entry| entry.id != *id);
    }

    /// Dial queued peers while slots are open
    async fn refill(&self) {
        let picked: Vec<QueueEntry> = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            let now = Instant::now();
            let mut slots = state.open_slots(self.inner.config.max_peers);
            let mut waiting = VecDeque::new();
            let mut picked = Vec::new();

            while let Some(entry) = state.queue.pop_front() {
                if state.sessions.contains_key(&entry.id) || state.dialing.contains(&entry.id) {
                    continue;
                }
                if slots == 0 || entry.not_before > now {
                    waiting.push_back(entry);
                    continue;
                }
                slots -= 1;
                state.dialing.insert(entry.id);
                state.handshaking += 1;
                picked.push(entry);
            }
            state.queue = waiting;
            picked
        };

        for entry in picked {
            if self.is_banned(&entry.id).await {
                self.inner.state.lock().await.release_dial(&entry.id);
                continue;
            }
            let rlpx = self.clone();
            self.track(tokio::spawn(async move {
                let _ = rlpx.dial(entry.id, entry.addr, true).await;
            }));
        }
    }

    async fn run_refill(self) {
        let period = self.inner.config.refill_interval.max(MIN_REFILL_INTERVAL);
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.inner.refill.notified() => {}
            }
            self.refill().await;
        }
    }

    async fn watch_discovery(self, mut events: broadcast::Receiver<DiscoveryEvent>) {
        loop {
            match events.recv().await {
                Ok(DiscoveryEvent::PeerAdded(record)) => {
                    if let Some(addr) = record.endpoint.tcp_addr() {
                        self.enqueue(record.id, addr).await;
                    }
                }
                Ok(DiscoveryEvent::PeerRemoved(record)) => self.dequeue(&record.id).await,
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Missed {} discovery events", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let has_slot = {
                        let mut state = self.inner.state.lock().await;
                        if state.closed {
                            break;
                        }
                        let open = state.open_slots(self.inner.config.max_peers) > 0;
                        if open {
                            state.handshaking += 1;
                        }
                        open
                    };
                    log::debug!("Inbound connection from {}", addr);
                    tokio::spawn(self.clone().handle_inbound(stream, addr, has_slot));
                }
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    self.emit(RlpxEvent::Error(e.to_string()));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Complete the crypto handshake; without a slot the remote is told
    /// TOO_MANY_PEERS right after it
    async fn handle_inbound(self, mut stream: TcpStream, addr: SocketAddr, has_slot: bool) {
        let handshake = tokio::time::timeout(
            self.inner.config.hello_timeout,
            session::respond(&mut stream, &self.inner.key),
        )
        .await;

        let secrets = match handshake {
            Ok(Ok(secrets)) => secrets,
            Ok(Err(e)) => {
                log::debug!("Handshake with {} failed: {}", addr, e);
                self.release_inbound(has_slot).await;
                return;
            }
            Err(_) => {
                log::debug!("Handshake with {} timed out", addr);
                self.release_inbound(has_slot).await;
                return;
            }
        };

        let session = Session::new(
            self.clone(),
            stream,
            secrets,
            addr,
            Direction::Inbound,
            has_slot,
        );
        let reject = (!has_slot).then_some(DisconnectReason::TooManyPeers);
        session.run(reject).await;
    }

    async fn release_inbound(&self, has_slot: bool) {
        if has_slot {
            let mut state = self.inner.state.lock().await;
            state.handshaking = state.handshaking.saturating_sub(1);
            drop(state);
            self.inner.refill.notify_one();
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn is_banned(&self, id: &NodeId) -> bool {
        match &self.inner.discovery {
            Some(discovery) => discovery.is_banned(id).await,
            None => false,
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    #[cfg(test)]
    fn tracked_tasks(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn emit(&self, event: RlpxEvent) {
        let _ = self.inner.events.send(event);
    }
}
