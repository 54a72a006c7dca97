//! RLPx sessions
//!
//! A session is one authenticated connection to one remote node. It runs
//! as a single task owning the framed socket, so messages are handled in
//! arrival order and the session's timers never race its handlers. The
//! [`Peer`] handle is what the rest of the node sees of it.

use super::codec::{FrameCodec, FrameError, RawMessage};
use super::ecies::{Handshake, HandshakeError, Secrets, ACK_LEN, AUTH_LEN};
use super::manager::Rlpx;
use super::message::{
    empty_payload, DisconnectReason, Hello, SharedCapability, BASE_PROTOCOL_LENGTH, DISCONNECT,
    HELLO, PING, PONG,
};
use crate::crypto::{KeyPair, NodeId};
use crate::sec::{self, Sec};
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;

/// Upper bound on flushing a DISCONNECT before the socket is dropped
const DISCONNECT_LINGER: Duration = Duration::from_secs(2);

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Requests from handles to the session task
#[derive(Debug)]
pub(crate) enum Command {
    Send(RawMessage),
    Disconnect(DisconnectReason),
    /// Report a protocol error and disconnect
    Fail(String),
}

/// Sends messages for one capability, translating codes by its offset
#[derive(Debug, Clone)]
pub struct ProtocolSender {
    commands: mpsc::UnboundedSender<Command>,
    offset: u8,
}

impl ProtocolSender {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, offset: u8) -> Self {
        Self { commands, offset }
    }

    /// Queue a message; false once the session has ended
    pub fn send(&self, code: u8, payload: Bytes) -> bool {
        let message = RawMessage::new(self.offset.saturating_add(code), payload);
        self.commands.send(Command::Send(message)).is_ok()
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.commands.send(Command::Disconnect(reason));
    }

    pub(crate) fn fail(&self, error: String) {
        let _ = self.commands.send(Command::Fail(error));
    }
}

/// Run the initiator side of the handshake over a fresh connection
pub(crate) async fn initiate(
    stream: &mut TcpStream,
    key: &KeyPair,
    remote_id: NodeId,
) -> Result<Secrets, HandshakeError> {
    let mut handshake = Handshake::initiator(key.clone(), remote_id);
    let auth = handshake.create_auth()?;
    stream.write_all(&auth).await?;

    let mut ack = vec![0u8; ACK_LEN];
    stream.read_exact(&mut ack).await?;
    handshake.parse_ack(&ack)?;
    handshake.secrets()
}

/// Run the responder side of the handshake over an accepted connection
pub(crate) async fn respond(stream: &mut TcpStream, key: &KeyPair) -> Result<Secrets, HandshakeError> {
    let mut handshake = Handshake::responder(key.clone());
    let mut auth = vec![0u8; AUTH_LEN];
    stream.read_exact(&mut auth).await?;
    handshake.parse_auth(&auth)?;

    let ack = handshake.create_ack()?;
    stream.write_all(&ack).await?;
    handshake.secrets()
}

/// What a session learns once HELLO has been accepted
struct Established {
    hello: Hello,
    capabilities: Vec<SharedCapability>,
    protocols: Vec<(SharedCapability, Sec)>,
}

struct PeerInner {
    id: NodeId,
    addr: SocketAddr,
    direction: Direction,
    commands: mpsc::UnboundedSender<Command>,
    established: OnceLock<Established>,
}

/// Handle to a connected remote node
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    fn new(
        id: NodeId,
        addr: SocketAddr,
        direction: Direction,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                id,
                addr,
                direction,
                commands,
                established: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// The remote HELLO, once accepted
    pub fn hello(&self) -> Option<&Hello> {
        self.inner.established.get().map(|e| &e.hello)
    }

    /// Capabilities both sides run, with their code offsets
    pub fn capabilities(&self) -> &[SharedCapability] {
        self.inner
            .established
            .get()
            .map(|e| e.capabilities.as_slice())
            .unwrap_or(&[])
    }

    /// The SEC envelope of this session, if `sec` was negotiated
    pub fn sec(&self) -> Option<&Sec> {
        self.inner
            .established
            .get()
            .and_then(|e| e.protocols.first())
            .map(|(_, sec)| sec)
    }

    /// Send DISCONNECT with `reason` and close the session
    pub fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.inner.commands.send(Command::Disconnect(reason));
    }

    /// Whether both handles refer to the same session
    pub fn ptr_eq(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Record the accepted HELLO and start one envelope per capability
    pub(crate) fn establish(
        &self,
        hello: Hello,
        capabilities: Vec<SharedCapability>,
        status_timeout: Duration,
    ) {
        let protocols = capabilities
            .iter()
            .filter(|shared| shared.capability.name == sec::PROTOCOL_NAME)
            .map(|shared| {
                let sender = ProtocolSender::new(self.inner.commands.clone(), shared.offset);
                let envelope = Sec::new(shared.capability.version, self.id(), sender, status_timeout);
                (shared.clone(), envelope)
            })
            .collect();

        let established = Established {
            hello,
            capabilities,
            protocols,
        };
        if self.inner.established.set(established).is_err() {
            log::warn!("Session with {} established twice", self.id());
        }
    }

    fn protocol_for(&self, code: u8) -> Option<&(SharedCapability, Sec)> {
        self.inner
            .established
            .get()?
            .protocols
            .iter()
            .find(|(shared, _)| shared.contains(code))
    }

    fn close_protocols(&self) {
        if let Some(established) = self.inner.established.get() {
            for (_, sec) in &established.protocols {
                sec.close();
            }
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("direction", &self.inner.direction)
            .finish()
    }
}

/// How a session ended: the reason and whether we initiated it
type Ending = (DisconnectReason, bool);

/// One authenticated connection, driven by its own task
pub(crate) struct Session {
    peer: Peer,
    framed: Framed<TcpStream, FrameCodec>,
    commands: mpsc::UnboundedReceiver<Command>,
    rlpx: Rlpx,
    /// Whether this session still counts as an in-flight handshake
    holds_slot: bool,
    pong_deadline: Option<Instant>,
}

impl Session {
    pub(crate) fn new(
        rlpx: Rlpx,
        stream: TcpStream,
        secrets: Secrets,
        addr: SocketAddr,
        direction: Direction,
        holds_slot: bool,
    ) -> Self {
        let config = rlpx.config();
        let remote_id = secrets.remote_id;
        let codec = FrameCodec::with_limits(secrets, config.chunk_size, config.max_message_size);
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            peer: Peer::new(remote_id, addr, direction, tx),
            framed: Framed::new(stream, codec),
            commands: rx,
            rlpx,
            holds_slot,
            pong_deadline: None,
        }
    }

    /// Drive the session to completion. With `reject` set, the remote is
    /// told the reason right after the handshake and the session ends.
    pub(crate) async fn run(mut self, reject: Option<DisconnectReason>) {
        let (reason, locally_initiated) = match reject {
            Some(reason) => self.close_with(reason).await,
            None => self.drive().await,
        };

        self.peer.close_protocols();
        self.rlpx
            .session_closed(&self.peer, reason, locally_initiated, self.holds_slot)
            .await;
    }

    async fn drive(&mut self) -> Ending {
        let listen_port = self.rlpx.listen_port().await;
        let config = self.rlpx.config();
        let hello_timeout = config.hello_timeout;
        let local_hello = Hello::new(
            &config.client_id,
            &config.capabilities,
            listen_port,
            self.rlpx.id(),
        );
        if let Err(e) = self
            .framed
            .send(RawMessage::new(HELLO, local_hello.encode()))
            .await
        {
            log::debug!("Failed to send HELLO to {}: {}", self.peer.addr(), e);
            return (DisconnectReason::TcpError, false);
        }

        let remote_hello = match tokio::time::timeout(hello_timeout, self.framed.next()).await {
            Err(_) => {
                log::debug!("No HELLO from {} within {:?}", self.peer.addr(), hello_timeout);
                return self.close_with(DisconnectReason::Timeout).await;
            }
            Ok(None) => return (DisconnectReason::TcpError, false),
            Ok(Some(Err(e))) => return self.fail(e.to_string()).await,
            Ok(Some(Ok(message))) => match message.code {
                HELLO => match Hello::decode(&message.payload) {
                    Ok(hello) => hello,
                    Err(e) => return self.fail(format!("Invalid HELLO: {}", e)).await,
                },
                DISCONNECT => return (DisconnectReason::decode(&message.payload), false),
                code => return self.fail(format!("Expected HELLO, got code {}", code)).await,
            },
        };

        if let Err(reason) = self.rlpx.admit(&self.peer, remote_hello).await {
            return self.close_with(reason).await;
        }
        self.holds_slot = false;

        self.run_established().await
    }

    async fn run_established(&mut self) -> Ending {
        let config = self.rlpx.config();
        let (ping_interval, pong_timeout) = (config.ping_interval, config.pong_timeout);
        let mut ping_timer = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

        loop {
            let pong_deadline = self.pong_deadline;
            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(message)) => {
                        if let Some(ending) = self.handle_message(message).await {
                            return ending;
                        }
                    }
                    Some(Err(e)) => return self.fail(e.to_string()).await,
                    None => return (DisconnectReason::TcpError, false),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send(message)) => {
                        if let Err(e) = self.framed.send(message).await {
                            log::debug!("Write to {} failed: {}", self.peer.addr(), e);
                            return (DisconnectReason::TcpError, false);
                        }
                    }
                    Some(Command::Disconnect(reason)) => return self.close_with(reason).await,
                    Some(Command::Fail(error)) => return self.fail(error).await,
                    None => return self.close_with(DisconnectReason::DisconnectRequested).await,
                },
                _ = ping_timer.tick() => {
                    if self.framed.send(RawMessage::new(PING, empty_payload())).await.is_err() {
                        return (DisconnectReason::TcpError, false);
                    }
                    if self.pong_deadline.is_none() {
                        self.pong_deadline = Some(Instant::now() + pong_timeout);
                    }
                },
                _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    log::debug!("No PONG from {} within {:?}", self.peer.addr(), pong_timeout);
                    return self.close_with(DisconnectReason::Timeout).await;
                },
            }
        }
    }

    async fn handle_message(&mut self, message: RawMessage) -> Option<Ending> {
        match message.code {
            DISCONNECT => {
                let reason = DisconnectReason::decode(&message.payload);
                log::debug!("{} disconnected: {}", self.peer.id(), reason);
                Some((reason, false))
            }
            PING => {
                let pong = RawMessage::new(PONG, empty_payload());
                match self.framed.send(pong).await {
                    Ok(()) => None,
                    Err(_) => Some((DisconnectReason::TcpError, false)),
                }
            }
            PONG => {
                self.pong_deadline = None;
                None
            }
            HELLO => Some(self.fail("Unexpected HELLO".to_string()).await),
            code if code < BASE_PROTOCOL_LENGTH => {
                log::trace!("Ignoring reserved code {} from {}", code, self.peer.id());
                None
            }
            code => {
                let result = match self.peer.protocol_for(code) {
                    Some((shared, sec)) => sec
                        .handle_message(code - shared.offset, message.payload)
                        .map_err(|e| e.to_string()),
                    None => Err(format!("Unknown message code {}", code)),
                };
                match result {
                    Ok(()) => None,
                    Err(error) => Some(self.fail(error).await),
                }
            }
        }
    }

    /// Report a protocol error, then disconnect with PROTOCOL_ERROR
    async fn fail(&mut self, error: String) -> Ending {
        self.rlpx.peer_error(&self.peer, error);
        self.close_with(DisconnectReason::ProtocolError).await
    }

    /// Send DISCONNECT, shut down our side and wait for the remote to close,
    /// all bounded by the linger time
    async fn close_with(&mut self, reason: DisconnectReason) -> Ending {
        log::debug!("Disconnecting {} ({})", self.peer.addr(), reason);
        let framed = &mut self.framed;
        let linger = tokio::time::timeout(DISCONNECT_LINGER, async move {
            framed
                .send(RawMessage::new(DISCONNECT, reason.encode()))
                .await?;
            framed.get_mut().shutdown().await?;
            while let Some(Ok(_)) = framed.next().await {}
            Ok::<(), FrameError>(())
        })
        .await;

        if let Ok(Err(e)) = linger {
            log::trace!("DISCONNECT to {} not delivered: {}", self.peer.addr(), e);
        }
        (reason, true)
    }
}
