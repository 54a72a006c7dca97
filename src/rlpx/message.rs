//! Base protocol messages
//!
//! HELLO, DISCONNECT, PING and PONG occupy the first 16 message codes of
//! every session; negotiated capabilities are laid out after them.

use crate::crypto::NodeId;
use rlp::{DecoderError, Rlp, RlpStream};
use std::fmt;

/// Base protocol version we announce
pub const BASE_PROTOCOL_VERSION: u32 = 5;

/// Oldest base protocol version we accept
pub const MIN_PROTOCOL_VERSION: u32 = 4;

/// Code space reserved for the base protocol
pub const BASE_PROTOCOL_LENGTH: u8 = 0x10;

pub const HELLO: u8 = 0x00;
pub const DISCONNECT: u8 = 0x01;
pub const PING: u8 = 0x02;
pub const PONG: u8 = 0x03;

/// Reasons carried by DISCONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    DisconnectRequested,
    TcpError,
    ProtocolError,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleVersion,
    NullNodeIdentity,
    ClientQuitting,
    UnexpectedIdentity,
    SameIdentity,
    Timeout,
    SubprotocolReason,
}

impl DisconnectReason {
    pub fn code(&self) -> u8 {
        match self {
            DisconnectReason::DisconnectRequested => 0x00,
            DisconnectReason::TcpError => 0x01,
            DisconnectReason::ProtocolError => 0x02,
            DisconnectReason::UselessPeer => 0x03,
            DisconnectReason::TooManyPeers => 0x04,
            DisconnectReason::AlreadyConnected => 0x05,
            DisconnectReason::IncompatibleVersion => 0x06,
            DisconnectReason::NullNodeIdentity => 0x07,
            DisconnectReason::ClientQuitting => 0x08,
            DisconnectReason::UnexpectedIdentity => 0x09,
            DisconnectReason::SameIdentity => 0x0a,
            DisconnectReason::Timeout => 0x0b,
            DisconnectReason::SubprotocolReason => 0x10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let reason = match code {
            0x00 => DisconnectReason::DisconnectRequested,
            0x01 => DisconnectReason::TcpError,
            0x02 => DisconnectReason::ProtocolError,
            0x03 => DisconnectReason::UselessPeer,
            0x04 => DisconnectReason::TooManyPeers,
            0x05 => DisconnectReason::AlreadyConnected,
            0x06 => DisconnectReason::IncompatibleVersion,
            0x07 => DisconnectReason::NullNodeIdentity,
            0x08 => DisconnectReason::ClientQuitting,
            0x09 => DisconnectReason::UnexpectedIdentity,
            0x0a => DisconnectReason::SameIdentity,
            0x0b => DisconnectReason::Timeout,
            0x10 => DisconnectReason::SubprotocolReason,
            _ => return None,
        };
        Some(reason)
    }

    /// DISCONNECT payload: `[reason]`
    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(1);
        stream.append(&(self.code() as u16));
        stream.out().to_vec()
    }

    /// Parse a DISCONNECT payload; accepts both `[reason]` and a bare reason.
    /// Empty or unknown payloads read as `DisconnectRequested`.
    pub fn decode(payload: &[u8]) -> Self {
        if payload.is_empty() {
            return DisconnectReason::DisconnectRequested;
        }
        let rlp = Rlp::new(payload);
        let code = if rlp.is_list() {
            rlp.val_at::<u16>(0)
        } else {
            rlp.as_val::<u16>()
        };

        code.ok()
            .and_then(|c| u8::try_from(c).ok())
            .and_then(Self::from_code)
            .unwrap_or(DisconnectReason::DisconnectRequested)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::DisconnectRequested => "disconnect requested",
            DisconnectReason::TcpError => "TCP error",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::AlreadyConnected => "already connected",
            DisconnectReason::IncompatibleVersion => "incompatible version",
            DisconnectReason::NullNodeIdentity => "null node identity",
            DisconnectReason::ClientQuitting => "client quitting",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::SameIdentity => "same identity",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::SubprotocolReason => "subprotocol reason",
        };
        write!(f, "{} (0x{:02x})", name, self.code())
    }
}

/// A sub-protocol we can run, with the size of its code space
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    pub name: String,
    pub version: u32,
    pub length: u8,
}

impl Capability {
    pub fn new(name: &str, version: u32, length: u8) -> Self {
        Self {
            name: name.to_string(),
            version,
            length,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A capability both sides run, placed in the session's code space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedCapability {
    pub capability: Capability,
    /// First message code of this capability
    pub offset: u8,
}

impl SharedCapability {
    /// Whether `code` falls in this capability's range
    pub fn contains(&self, code: u8) -> bool {
        code >= self.offset && (code - self.offset) < self.capability.length
    }
}

/// Intersect local and remote capabilities.
///
/// For every name both sides list, the highest version both support wins.
/// Offsets start after the base protocol and follow name order.
pub fn negotiate(local: &[Capability], remote: &[(String, u32)]) -> Vec<SharedCapability> {
    let mut chosen: Vec<Capability> = Vec::new();
    for capability in local {
        let remote_has = remote
            .iter()
            .any(|(name, version)| *name == capability.name && *version == capability.version);
        if !remote_has {
            continue;
        }
        match chosen.iter_mut().find(|c| c.name == capability.name) {
            Some(existing) if existing.version < capability.version => *existing = capability.clone(),
            Some(_) => {}
            None => chosen.push(capability.clone()),
        }
    }

    chosen.sort_by(|a, b| a.name.cmp(&b.name));

    let mut offset = BASE_PROTOCOL_LENGTH;
    chosen
        .into_iter()
        .map(|capability| {
            let shared = SharedCapability {
                offset,
                capability,
            };
            offset = offset.saturating_add(shared.capability.length);
            shared
        })
        .collect()
}

/// First message of every session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub client_id: String,
    pub capabilities: Vec<(String, u32)>,
    pub listen_port: u16,
    pub id: NodeId,
}

impl Hello {
    pub fn new(client_id: &str, capabilities: &[Capability], listen_port: u16, id: NodeId) -> Self {
        Self {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_id: client_id.to_string(),
            capabilities: capabilities
                .iter()
                .map(|c| (c.name.clone(), c.version))
                .collect(),
            listen_port,
            id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(5);
        stream.append(&self.protocol_version);
        stream.append(&self.client_id);
        stream.begin_list(self.capabilities.len());
        for (name, version) in &self.capabilities {
            stream.begin_list(2);
            stream.append(name);
            stream.append(version);
        }
        stream.append(&self.listen_port);
        stream.append(&self.id.as_bytes().to_vec());
        stream.out().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(payload);
        if rlp.item_count()? < 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }

        let capabilities = rlp
            .at(2)?
            .iter()
            .map(|cap| -> Result<(String, u32), DecoderError> {
                Ok((cap.val_at(0)?, cap.val_at(1)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let id_bytes: Vec<u8> = rlp.val_at(4)?;
        let id = NodeId::from_slice(&id_bytes).map_err(|_| DecoderError::RlpInvalidLength)?;

        Ok(Self {
            protocol_version: rlp.val_at(0)?,
            client_id: rlp.val_at(1)?,
            capabilities,
            listen_port: rlp.val_at(3)?,
            id,
        })
    }
}

/// Empty list payload for PING / PONG
pub fn empty_payload() -> Vec<u8> {
    RlpStream::new_list(0).out().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_encode_decode() {
        let caps = vec![Capability::new("sec", 1, 8), Capability::new("sec", 2, 13)];
        let hello = Hello::new("sec-node/0.1.0", &caps, 30303, NodeId::random());

        let decoded = Hello::decode(&hello.encode()).unwrap();
        assert_eq!(decoded, hello);
        assert_eq!(decoded.protocol_version, BASE_PROTOCOL_VERSION);
    }

    #[test]
    fn test_hello_rejects_short_list() {
        let mut stream = RlpStream::new_list(2);
        stream.append(&5u32);
        stream.append(&"client".to_string());
        assert!(Hello::decode(&stream.out()).is_err());
    }

    #[test]
    fn test_disconnect_reason_codes() {
        for code in 0u8..=0x20 {
            if let Some(reason) = DisconnectReason::from_code(code) {
                assert_eq!(reason.code(), code);
                assert_eq!(DisconnectReason::decode(&reason.encode()), reason);
            }
        }
        assert_eq!(DisconnectReason::from_code(0x04), Some(DisconnectReason::TooManyPeers));
        assert_eq!(DisconnectReason::from_code(0x0c), None);
    }

    #[test]
    fn test_disconnect_reason_lenient_decode() {
        assert_eq!(DisconnectReason::decode(&[]), DisconnectReason::DisconnectRequested);
        // Bare integer instead of a list
        assert_eq!(DisconnectReason::decode(&[0x08]), DisconnectReason::ClientQuitting);
        assert_eq!(DisconnectReason::decode(&[0xc1, 0x0b]), DisconnectReason::Timeout);
    }

    #[test]
    fn test_negotiate_highest_shared_version() {
        let local = vec![Capability::new("sec", 1, 8), Capability::new("sec", 2, 13)];
        let remote = vec![("sec".to_string(), 1), ("sec".to_string(), 2)];

        let shared = negotiate(&local, &remote);
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].capability.version, 2);
        assert_eq!(shared[0].offset, BASE_PROTOCOL_LENGTH);

        let older = negotiate(&local, &[("sec".to_string(), 1)]);
        assert_eq!(older[0].capability.version, 1);
    }

    #[test]
    fn test_negotiate_offsets_by_name() {
        let local = vec![Capability::new("zzz", 1, 4), Capability::new("aaa", 1, 8)];
        let remote = vec![("zzz".to_string(), 1), ("aaa".to_string(), 1), ("bbb".to_string(), 1)];

        let shared = negotiate(&local, &remote);
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0].capability.name, "aaa");
        assert_eq!(shared[0].offset, 0x10);
        assert_eq!(shared[1].capability.name, "zzz");
        assert_eq!(shared[1].offset, 0x18);
        assert!(shared[1].contains(0x1b));
        assert!(!shared[1].contains(0x1c));
    }

    #[test]
    fn test_negotiate_no_overlap() {
        let local = vec![Capability::new("sec", 2, 13)];
        assert!(negotiate(&local, &[("sec".to_string(), 1)]).is_empty());
        assert!(negotiate(&local, &[]).is_empty());
    }
}
