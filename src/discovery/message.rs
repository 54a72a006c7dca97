//! Discovery wire messages
//!
//! Every packet is `hash(32) || signature(65) || type(1) || rlp(data)` where
//! `hash = keccak256(signature || type || data)` and the signature is a
//! recoverable secp256k1 signature over `keccak256(type || data)`. The
//! sender's node id is recovered from the signature.

use crate::crypto::{keccak256, recover_public_key, KeyError, KeyPair, NodeId, SIGNATURE_LEN};
use crate::routing::Endpoint;
use rlp::{DecoderError, Rlp, RlpStream};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Discovery protocol version announced in PING
pub const DISCOVERY_VERSION: u32 = 4;

/// Upper bound on a discovery datagram
pub const MAX_PACKET_SIZE: usize = 1280;

/// Maximum entries in one NEIGHBOURS packet
pub const MAX_NEIGHBOURS_PER_PACKET: usize = 12;

/// Lifetime of an outgoing message, in seconds
pub const MESSAGE_TTL_SECS: u64 = 60;

const HASH_LEN: usize = 32;
const HEADER_LEN: usize = HASH_LEN + SIGNATURE_LEN;

/// Packet codec errors
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),
    #[error("Packet too large: {0} bytes")]
    TooLarge(usize),
    #[error("Packet hash mismatch")]
    HashMismatch,
    #[error("Unknown packet type: {0}")]
    UnknownType(u8),
    #[error("Invalid IP address length: {0}")]
    InvalidAddress(usize),
    #[error("RLP error: {0}")]
    Rlp(#[from] DecoderError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

/// Liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

/// Reply to a ping, echoing its packet hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    pub ping_hash: [u8; 32],
    pub expiration: u64,
}

/// Request for the records closest to `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNeighbours {
    pub target: NodeId,
    pub expiration: u64,
}

/// Reply to FINDNEIGHBOURS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbours {
    pub nodes: Vec<(NodeId, Endpoint)>,
    pub expiration: u64,
}

/// Discovery message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNeighbours(FindNeighbours),
    Neighbours(Neighbours),
}

/// A decoded, authenticated packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub message: Message,
    /// Id recovered from the signature
    pub sender: NodeId,
    /// Packet hash, echoed by PONG
    pub hash: [u8; 32],
}

/// Absolute expiration for a message sent now
pub fn expiration_from_now() -> u64 {
    unix_now() + MESSAGE_TTL_SECS
}

pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl Message {
    pub fn packet_type(&self) -> u8 {
        match self {
            Message::Ping(_) => 0x01,
            Message::Pong(_) => 0x02,
            Message::FindNeighbours(_) => 0x03,
            Message::Neighbours(_) => 0x04,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Ping(_) => "PING",
            Message::Pong(_) => "PONG",
            Message::FindNeighbours(_) => "FINDNEIGHBOURS",
            Message::Neighbours(_) => "NEIGHBOURS",
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Message::Ping(m) => m.expiration,
            Message::Pong(m) => m.expiration,
            Message::FindNeighbours(m) => m.expiration,
            Message::Neighbours(m) => m.expiration,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration() < now
    }

    fn encode_data(&self) -> Vec<u8> {
        match self {
            Message::Ping(ping) => {
                let mut s = RlpStream::new_list(4);
                s.append(&ping.version);
                append_endpoint(&mut s, &ping.from);
                append_endpoint(&mut s, &ping.to);
                s.append(&ping.expiration);
                s.out().to_vec()
            }
            Message::Pong(pong) => {
                let mut s = RlpStream::new_list(3);
                append_endpoint(&mut s, &pong.to);
                s.append(&pong.ping_hash.to_vec());
                s.append(&pong.expiration);
                s.out().to_vec()
            }
            Message::FindNeighbours(find) => {
                let mut s = RlpStream::new_list(2);
                s.append(&find.target.as_bytes().to_vec());
                s.append(&find.expiration);
                s.out().to_vec()
            }
            Message::Neighbours(neighbours) => {
                let mut s = RlpStream::new_list(2);
                s.begin_list(neighbours.nodes.len());
                for (id, endpoint) in &neighbours.nodes {
                    s.begin_list(4);
                    s.append(&ip_bytes(&endpoint.address));
                    s.append(&endpoint.udp_port);
                    s.append(&endpoint.tcp_port.unwrap_or(0));
                    s.append(&id.as_bytes().to_vec());
                }
                s.append(&neighbours.expiration);
                s.out().to_vec()
            }
        }
    }

    fn decode_data(packet_type: u8, data: &[u8]) -> Result<Self, PacketError> {
        let rlp = Rlp::new(data);
        let message = match packet_type {
            0x01 => Message::Ping(Ping {
                version: rlp.val_at(0)?,
                from: decode_endpoint(&rlp.at(1)?)?,
                to: decode_endpoint(&rlp.at(2)?)?,
                expiration: rlp.val_at(3)?,
            }),
            0x02 => {
                let hash: Vec<u8> = rlp.val_at(1)?;
                let ping_hash: [u8; 32] = hash
                    .as_slice()
                    .try_into()
                    .map_err(|_| DecoderError::RlpInvalidLength)?;
                Message::Pong(Pong {
                    to: decode_endpoint(&rlp.at(0)?)?,
                    ping_hash,
                    expiration: rlp.val_at(2)?,
                })
            }
            0x03 => {
                let target: Vec<u8> = rlp.val_at(0)?;
                Message::FindNeighbours(FindNeighbours {
                    target: NodeId::from_slice(&target)?,
                    expiration: rlp.val_at(1)?,
                })
            }
            0x04 => {
                let list = rlp.at(0)?;
                let mut nodes = Vec::with_capacity(list.item_count()?);
                for node in list.iter() {
                    let id: Vec<u8> = node.val_at(3)?;
                    nodes.push((NodeId::from_slice(&id)?, decode_endpoint(&node)?));
                }
                Message::Neighbours(Neighbours {
                    nodes,
                    expiration: rlp.val_at(1)?,
                })
            }
            other => return Err(PacketError::UnknownType(other)),
        };
        Ok(message)
    }
}

fn ip_bytes(address: &IpAddr) -> Vec<u8> {
    match address {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn append_endpoint(s: &mut RlpStream, endpoint: &Endpoint) {
    s.begin_list(3);
    s.append(&ip_bytes(&endpoint.address));
    s.append(&endpoint.udp_port);
    s.append(&endpoint.tcp_port.unwrap_or(0));
}

/// Decode `[ip, udp, tcp, ...]`; a zero TCP port means none
fn decode_endpoint(rlp: &Rlp<'_>) -> Result<Endpoint, PacketError> {
    let ip: Vec<u8> = rlp.val_at(0)?;
    let address = match ip.len() {
        4 => {
            let octets: [u8; 4] = [ip[0], ip[1], ip[2], ip[3]];
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&ip);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        len => return Err(PacketError::InvalidAddress(len)),
    };
    let udp_port: u16 = rlp.val_at(1)?;
    let tcp_port: u16 = rlp.val_at(2)?;
    Ok(Endpoint::new(
        address,
        udp_port,
        (tcp_port != 0).then_some(tcp_port),
    ))
}

/// Sign and serialize a message, returning the packet and its hash
pub fn encode(message: &Message, key: &KeyPair) -> Result<(Vec<u8>, [u8; 32]), PacketError> {
    let mut type_and_data = vec![message.packet_type()];
    type_and_data.extend_from_slice(&message.encode_data());

    let signature = key.sign_recoverable(&keccak256(&type_and_data))?;

    let mut signed = Vec::with_capacity(SIGNATURE_LEN + type_and_data.len());
    signed.extend_from_slice(&signature);
    signed.extend_from_slice(&type_and_data);
    let hash = keccak256(&signed);

    let mut packet = Vec::with_capacity(HASH_LEN + signed.len());
    packet.extend_from_slice(&hash);
    packet.extend_from_slice(&signed);
    if packet.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge(packet.len()));
    }
    Ok((packet, hash))
}

/// Verify and parse a received packet
pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
    if bytes.len() <= HEADER_LEN {
        return Err(PacketError::TooShort(bytes.len()));
    }
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge(bytes.len()));
    }

    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&bytes[..HASH_LEN]);
    if keccak256(&bytes[HASH_LEN..]) != hash {
        return Err(PacketError::HashMismatch);
    }

    let signature = &bytes[HASH_LEN..HEADER_LEN];
    let type_and_data = &bytes[HEADER_LEN..];
    let public_key = recover_public_key(signature, &keccak256(type_and_data))?;

    let message = Message::decode_data(type_and_data[0], &type_and_data[1..])?;
    Ok(Packet {
        message,
        sender: NodeId::from_public_key(&public_key),
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, Some(port))
    }

    #[test]
    fn test_ping_recovers_sender() {
        let key = KeyPair::generate();
        let ping = Message::Ping(Ping {
            version: DISCOVERY_VERSION,
            from: endpoint(30303),
            to: Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 30304, None),
            expiration: expiration_from_now(),
        });

        let (bytes, hash) = encode(&ping, &key).unwrap();
        let packet = decode(&bytes).unwrap();

        assert_eq!(packet.sender, key.node_id());
        assert_eq!(packet.hash, hash);
        assert_eq!(packet.message, ping);
        match packet.message {
            Message::Ping(p) => assert_eq!(p.to.tcp_port, None),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_neighbours_fit_in_one_packet() {
        let key = KeyPair::generate();
        let nodes = (0..MAX_NEIGHBOURS_PER_PACKET)
            .map(|i| (KeyPair::generate().node_id(), endpoint(30000 + i as u16)))
            .collect();
        let message = Message::Neighbours(Neighbours {
            nodes,
            expiration: expiration_from_now(),
        });

        let (bytes, _) = encode(&message, &key).unwrap();
        assert!(bytes.len() <= MAX_PACKET_SIZE);
        assert_eq!(decode(&bytes).unwrap().message, message);
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let key = KeyPair::generate();
        let message = Message::FindNeighbours(FindNeighbours {
            target: key.node_id(),
            expiration: expiration_from_now(),
        });
        let (mut bytes, _) = encode(&message, &key).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(decode(&bytes), Err(PacketError::HashMismatch)));
        assert!(matches!(decode(&bytes[..50]), Err(PacketError::TooShort(50))));
    }

    #[test]
    fn test_expiration() {
        let pong = Message::Pong(Pong {
            to: endpoint(1),
            ping_hash: [7u8; 32],
            expiration: 100,
        });
        assert!(pong.is_expired(101));
        assert!(!pong.is_expired(100));
        assert!(!Message::Pong(Pong {
            to: endpoint(1),
            ping_hash: [7u8; 32],
            expiration: expiration_from_now(),
        })
        .is_expired(unix_now()));
    }
}
