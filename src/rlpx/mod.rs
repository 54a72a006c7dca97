//! RLPx transport
//!
//! Encrypted, authenticated TCP sessions between nodes:
//! - `ecies`: the auth / ack handshake and the secrets it derives
//! - `mac` and `codec`: the framed, MAC-protected message stream
//! - `message`: HELLO, DISCONNECT and capability negotiation
//! - `session` and `manager`: per-connection tasks and the slot budget

pub mod codec;
pub mod ecies;
pub mod mac;
pub mod manager;
pub mod message;
pub mod session;

pub use codec::{FrameCodec, FrameError, RawMessage, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
pub use ecies::{Handshake, HandshakeError, Secrets};
pub use manager::{Rlpx, RlpxConfig, RlpxError, RlpxEvent};
pub use message::{
    negotiate, Capability, DisconnectReason, Hello, SharedCapability, BASE_PROTOCOL_VERSION,
};
pub use session::{Direction, Peer, ProtocolSender};
