//! SEC message codes and the STATUS payload

use rlp::{DecoderError, Rlp, RlpStream};
use std::fmt;
use thiserror::Error;

/// Envelope errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{field} mismatch: {local} / {remote}")]
    StatusMismatch {
        field: &'static str,
        local: String,
        remote: String,
    },
    #[error("Please send status message through send_status")]
    StatusViaSendMessage,
    #[error("Code {code} not allowed with version {version}")]
    NotAllowed { code: u8, version: u32 },
    #[error("Unknown code {0}")]
    UnknownCode(u8),
    #[error("Uncontrolled status message")]
    UncontrolledStatus,
    #[error("Invalid payload: {0}")]
    Rlp(#[from] DecoderError),
    #[error("Peer disconnected")]
    Disconnected,
}

/// SEC message codes, relative to the capability offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCode {
    Status,
    NewBlockHashes,
    Tx,
    GetBlockHeaders,
    BlockHeaders,
    GetBlockBodies,
    BlockBodies,
    NewBlock,
    GetNodeData,
    NodeData,
    GetReceipts,
    Receipts,
    NodesIpSync,
}

impl MessageCode {
    pub fn code(&self) -> u8 {
        match self {
            MessageCode::Status => 0x00,
            MessageCode::NewBlockHashes => 0x01,
            MessageCode::Tx => 0x02,
            MessageCode::GetBlockHeaders => 0x03,
            MessageCode::BlockHeaders => 0x04,
            MessageCode::GetBlockBodies => 0x05,
            MessageCode::BlockBodies => 0x06,
            MessageCode::NewBlock => 0x07,
            MessageCode::GetNodeData => 0x08,
            MessageCode::NodeData => 0x09,
            MessageCode::GetReceipts => 0x0a,
            MessageCode::Receipts => 0x0b,
            MessageCode::NodesIpSync => 0x0c,
        }
    }

    /// Lowest protocol version carrying this code
    pub fn min_version(&self) -> u32 {
        if self.code() >= MessageCode::GetNodeData.code() {
            2
        } else {
            1
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageCode::Status => "STATUS",
            MessageCode::NewBlockHashes => "NEW_BLOCK_HASHES",
            MessageCode::Tx => "TX",
            MessageCode::GetBlockHeaders => "GET_BLOCK_HEADERS",
            MessageCode::BlockHeaders => "BLOCK_HEADERS",
            MessageCode::GetBlockBodies => "GET_BLOCK_BODIES",
            MessageCode::BlockBodies => "BLOCK_BODIES",
            MessageCode::NewBlock => "NEW_BLOCK",
            MessageCode::GetNodeData => "GET_NODE_DATA",
            MessageCode::NodeData => "NODE_DATA",
            MessageCode::GetReceipts => "GET_RECEIPTS",
            MessageCode::Receipts => "RECEIPTS",
            MessageCode::NodesIpSync => "NODES_IP_SYNC",
        }
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let code = match code {
            0x00 => MessageCode::Status,
            0x01 => MessageCode::NewBlockHashes,
            0x02 => MessageCode::Tx,
            0x03 => MessageCode::GetBlockHeaders,
            0x04 => MessageCode::BlockHeaders,
            0x05 => MessageCode::GetBlockBodies,
            0x06 => MessageCode::BlockBodies,
            0x07 => MessageCode::NewBlock,
            0x08 => MessageCode::GetNodeData,
            0x09 => MessageCode::NodeData,
            0x0a => MessageCode::GetReceipts,
            0x0b => MessageCode::Receipts,
            0x0c => MessageCode::NodesIpSync,
            other => return Err(ProtocolError::UnknownCode(other)),
        };
        Ok(code)
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Chain parameters exchanged in STATUS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub network_id: u64,
    /// Big-endian total difficulty
    pub total_difficulty: Vec<u8>,
    pub best_hash: [u8; 32],
    pub genesis_hash: [u8; 32],
    pub chain_id: u64,
}

/// STATUS as sent on the wire, tagged with the envelope version
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusMessage {
    pub version: u32,
    pub status: Status,
}

impl StatusMessage {
    /// `[version, network id, total difficulty, best hash, genesis hash, chain id]`
    pub fn encode(&self) -> Vec<u8> {
        let status = &self.status;
        let mut stream = RlpStream::new_list(6);
        stream.append(&self.version);
        stream.append(&status.network_id);
        stream.append(&status.total_difficulty);
        stream.append(&status.best_hash.to_vec());
        stream.append(&status.genesis_hash.to_vec());
        stream.append(&status.chain_id);
        stream.out().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(payload);
        if rlp.item_count()? < 6 {
            return Err(DecoderError::RlpIncorrectListLen);
        }

        Ok(Self {
            version: rlp.val_at(0)?,
            status: Status {
                network_id: rlp.val_at(1)?,
                total_difficulty: rlp.val_at(2)?,
                best_hash: hash_at(&rlp, 3)?,
                genesis_hash: hash_at(&rlp, 4)?,
                chain_id: rlp.val_at(5)?,
            },
        })
    }

    /// First differing field, in protocol order
    pub fn compare(&self, remote: &StatusMessage) -> Result<(), ProtocolError> {
        let mismatch = |field: &'static str, local: String, remote: String| {
            Err(ProtocolError::StatusMismatch {
                field,
                local,
                remote,
            })
        };

        if self.version != remote.version {
            return mismatch(
                "Protocol version",
                self.version.to_string(),
                remote.version.to_string(),
            );
        }
        if self.status.network_id != remote.status.network_id {
            return mismatch(
                "NetworkId",
                self.status.network_id.to_string(),
                remote.status.network_id.to_string(),
            );
        }
        if self.status.genesis_hash != remote.status.genesis_hash {
            return mismatch(
                "Genesis block",
                hex::encode(self.status.genesis_hash),
                hex::encode(remote.status.genesis_hash),
            );
        }
        if self.status.chain_id != remote.status.chain_id {
            return mismatch(
                "Chain ID",
                self.status.chain_id.to_string(),
                remote.status.chain_id.to_string(),
            );
        }
        Ok(())
    }
}

fn hash_at(rlp: &Rlp, index: usize) -> Result<[u8; 32], DecoderError> {
    let bytes: Vec<u8> = rlp.val_at(index)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| DecoderError::RlpInvalidLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> StatusMessage {
        StatusMessage {
            version: 2,
            status: Status {
                network_id: 1,
                total_difficulty: vec![0x04, 0x00, 0x00, 0x00, 0x00],
                best_hash: [0xd4; 32],
                genesis_hash: [0xd4; 32],
                chain_id: 1,
            },
        }
    }

    #[test]
    fn test_message_code_roundtrip() {
        for code in 0u8..=0x0c {
            assert_eq!(MessageCode::try_from(code).unwrap().code(), code);
        }
        assert_eq!(MessageCode::try_from(0x55), Err(ProtocolError::UnknownCode(0x55)));
    }

    #[test]
    fn test_version_gates() {
        assert_eq!(MessageCode::NewBlock.min_version(), 1);
        assert_eq!(MessageCode::GetNodeData.min_version(), 2);
        assert_eq!(MessageCode::NodesIpSync.min_version(), 2);
    }

    #[test]
    fn test_status_encode_decode() {
        let message = status();
        assert_eq!(StatusMessage::decode(&message.encode()).unwrap(), message);
        assert!(StatusMessage::decode(&[0xc0]).is_err());
    }

    #[test]
    fn test_status_compare_network_id() {
        let local = status();
        let mut remote = status();
        remote.status.network_id = 2;

        let err = local.compare(&remote).unwrap_err();
        assert_eq!(err.to_string(), "NetworkId mismatch: 1 / 2");
    }

    #[test]
    fn test_status_compare_genesis() {
        let local = status();
        let mut remote = status();
        remote.status.genesis_hash = [0u8; 32];

        let err = local.compare(&remote).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Genesis block mismatch: {} / {}", "d4".repeat(32), "00".repeat(32))
        );
    }

    #[test]
    fn test_status_best_hash_not_compared() {
        let local = status();
        let mut remote = status();
        remote.status.best_hash = [1u8; 32];
        remote.status.total_difficulty = vec![0x01];
        assert!(local.compare(&remote).is_ok());
    }
}
