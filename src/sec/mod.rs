//! SEC sub-protocol envelope
//!
//! Runs over an RLPx session: a status handshake that both sides must
//! complete in time, and code validation against the negotiated version.
//! Payloads of non-STATUS messages are passed through untouched.

pub mod message;
pub mod protocol;

pub use message::{MessageCode, ProtocolError, Status};
pub use protocol::{capabilities, Sec, SecEvent, PROTOCOL_NAME, STATUS_TIMEOUT};
