//! SEC envelope
//!
//! One instance runs per session that negotiated a `sec` capability. It
//! owns the status handshake (with its timeout), validates message codes
//! against the negotiated version and counts inbound traffic per code.

use super::message::{MessageCode, ProtocolError, Status, StatusMessage};
use crate::crypto::NodeId;
use crate::rlpx::{Capability, DisconnectReason, ProtocolSender};
use bytes::Bytes;
use rlp::Rlp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capability name
pub const PROTOCOL_NAME: &str = "sec";

/// How long both statuses may take to arrive
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_SIZE: usize = 256;

/// `sec/1` and `sec/2` with their code-space sizes
pub fn capabilities() -> Vec<Capability> {
    vec![
        Capability::new(PROTOCOL_NAME, 1, 8),
        Capability::new(PROTOCOL_NAME, 2, 13),
    ]
}

/// Notifications published by an envelope
#[derive(Debug, Clone)]
pub enum SecEvent {
    /// Both statuses exchanged and compatible; carries the remote status
    Status(Status),
    /// Any non-STATUS message, payload still RLP encoded
    Message { code: MessageCode, payload: Bytes },
}

#[derive(Default)]
struct SecState {
    status: Option<StatusMessage>,
    peer_status: Option<StatusMessage>,
    status_timer: Option<JoinHandle<()>>,
    counts: HashMap<MessageCode, u64>,
}

struct SecInner {
    version: u32,
    peer_id: NodeId,
    sender: ProtocolSender,
    state: Mutex<SecState>,
    events: broadcast::Sender<SecEvent>,
}

/// Handle to the SEC envelope of one session
#[derive(Clone)]
pub struct Sec {
    inner: Arc<SecInner>,
}

impl Sec {
    /// Create the envelope and start its status timer. Must be called from
    /// within a tokio runtime.
    pub fn new(version: u32, peer_id: NodeId, sender: ProtocolSender, status_timeout: Duration) -> Self {
        let timer = {
            let sender = sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(status_timeout).await;
                log::debug!("No status from {} within {:?}", peer_id, status_timeout);
                sender.disconnect(DisconnectReason::Timeout);
            })
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(SecInner {
                version,
                peer_id,
                sender,
                state: Mutex::new(SecState {
                    status_timer: Some(timer),
                    ..Default::default()
                }),
                events,
            }),
        }
    }

    /// Negotiated protocol version
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn peer_id(&self) -> NodeId {
        self.inner.peer_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecEvent> {
        self.inner.events.subscribe()
    }

    /// Number of inbound messages seen with `code`
    pub fn message_count(&self, code: MessageCode) -> u64 {
        self.state().counts.get(&code).copied().unwrap_or(0)
    }

    /// Send our status; ignored if one is already pending in this exchange
    pub fn send_status(&self, status: Status) -> Result<(), ProtocolError> {
        let outcome = {
            let mut state = self.state();
            if state.status.is_some() {
                return Ok(());
            }

            let message = StatusMessage {
                version: self.inner.version,
                status,
            };
            log::debug!(
                "Sending STATUS to {} (sec/{}): network {}",
                self.inner.peer_id,
                self.inner.version,
                message.status.network_id
            );
            if !self
                .inner
                .sender
                .send(MessageCode::Status.code(), message.encode().into())
            {
                return Err(ProtocolError::Disconnected);
            }
            state.status = Some(message);
            self.check_status(&mut state)
        };

        match outcome {
            Ok(remote) => {
                self.emit_status(remote);
                Ok(())
            }
            Err(e) => {
                self.inner.sender.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Send a non-STATUS message; the payload must be RLP encoded
    pub fn send_message(&self, code: u8, payload: Bytes) -> Result<(), ProtocolError> {
        let code = MessageCode::try_from(code)?;
        if code == MessageCode::Status {
            return Err(ProtocolError::StatusViaSendMessage);
        }
        self.check_version(code)?;

        log::debug!("Sending {} to {}", code, self.inner.peer_id);
        if !self.inner.sender.send(code.code(), payload) {
            return Err(ProtocolError::Disconnected);
        }
        Ok(())
    }

    /// Stop the status timer; called when the session ends
    pub fn close(&self) {
        if let Some(timer) = self.state().status_timer.take() {
            timer.abort();
        }
    }

    /// Inbound message with `code` relative to the capability offset
    pub(crate) fn handle_message(&self, code: u8, payload: Bytes) -> Result<(), ProtocolError> {
        let code = MessageCode::try_from(code)?;
        self.check_version(code)?;
        Rlp::new(&payload).payload_info()?;

        if code != MessageCode::Status {
            *self.state().counts.entry(code).or_insert(0) += 1;
            log::trace!("Received {} from {}", code, self.inner.peer_id);
            let _ = self.inner.events.send(SecEvent::Message { code, payload });
            return Ok(());
        }

        let remote = {
            let mut state = self.state();
            if state.peer_status.is_some() {
                return Err(ProtocolError::UncontrolledStatus);
            }
            *state.counts.entry(code).or_insert(0) += 1;
            state.peer_status = Some(StatusMessage::decode(&payload)?);
            self.check_status(&mut state)?
        };
        self.emit_status(remote);
        Ok(())
    }

    fn check_version(&self, code: MessageCode) -> Result<(), ProtocolError> {
        if code.min_version() > self.inner.version {
            return Err(ProtocolError::NotAllowed {
                code: code.code(),
                version: self.inner.version,
            });
        }
        Ok(())
    }

    /// Once both statuses are present: stop the timer, compare them and
    /// reset both so a later exchange is possible
    fn check_status(&self, state: &mut SecState) -> Result<Option<Status>, ProtocolError> {
        let (Some(local), Some(remote)) = (&state.status, &state.peer_status) else {
            return Ok(None);
        };
        let result = local.compare(remote);

        if let Some(timer) = state.status_timer.take() {
            timer.abort();
        }
        result?;

        state.status = None;
        Ok(state.peer_status.take().map(|remote| remote.status))
    }

    fn emit_status(&self, remote: Option<Status>) {
        if let Some(status) = remote {
            log::info!(
                "Status exchanged with {} (network {})",
                self.inner.peer_id,
                status.network_id
            );
            let _ = self.inner.events.send(SecEvent::Status(status));
        }
    }

    fn state(&self) -> MutexGuard<'_, SecState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Sec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sec")
            .field("version", &self.inner.version)
            .field("peer_id", &self.inner.peer_id)
            .finish()
    }
}
