//! Node identity keys
//!
//! Every participant is identified by a secp256k1 key pair. The node id is
//! the 64 byte uncompressed public key without its `0x04` prefix; it is the
//! identity recovered from discovery packet signatures and announced in HELLO.

use rand::rngs::OsRng;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{ecdh, Message, PublicKey, Secp256k1, SecretKey};
use std::fmt;
use thiserror::Error;

use super::hash::keccak256;

/// Length of a serialized node id
pub const NODE_ID_LEN: usize = 64;

/// Length of a recoverable signature (r || s || v)
pub const SIGNATURE_LEN: usize = 65;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// Identity of a participant, derived from its public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Wrap raw id bytes
    pub fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse an id from a byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self(raw))
    }

    /// Derive the id of a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let serialized = public_key.serialize_uncompressed();
        let mut raw = [0u8; NODE_ID_LEN];
        raw.copy_from_slice(&serialized[1..]);
        Self(raw)
    }

    /// Parse an id from its hex representation
    pub fn from_hex(hex_id: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_id).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }

    /// A random id, used as a lookup target
    pub fn random() -> Self {
        let mut raw = [0u8; NODE_ID_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut raw[..]);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Recover the public key this id was derived from
    pub fn to_public_key(&self) -> Result<PublicKey, KeyError> {
        let mut serialized = [0u8; NODE_ID_LEN + 1];
        serialized[0] = 0x04;
        serialized[1..].copy_from_slice(&self.0);
        PublicKey::from_slice(&serialized).map_err(|_| KeyError::InvalidPublicKey)
    }

    /// Keccak-256 of the id; the key space routing distances are measured in
    pub fn hash(&self) -> [u8; 32] {
        keccak256(&self.0)
    }

    /// Whether every byte is zero
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated form for logs
        write!(f, "{}..{}", hex::encode(&self.0[..4]), hex::encode(&self.0[60..]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// The node id announced for this key
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key)
    }

    /// Sign a 32 byte digest, producing `r || s || recovery id`
    pub fn sign_recoverable(&self, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_LEN], KeyError> {
        sign_recoverable(&self.secret_key, digest)
    }

    /// X coordinate of the ECDH shared point with a remote public key
    pub fn ecdh(&self, remote: &PublicKey) -> [u8; 32] {
        ecdh_x(remote, &self.secret_key)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// Sign a digest with a secret key, producing a recoverable signature
pub fn sign_recoverable(
    secret_key: &SecretKey,
    digest: &[u8; 32],
) -> Result<[u8; SIGNATURE_LEN], KeyError> {
    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(digest)?;
    let (recovery_id, compact) = secp
        .sign_ecdsa_recoverable(&message, secret_key)
        .serialize_compact();

    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    Ok(out)
}

/// Recover the signer's public key from a recoverable signature
pub fn recover_public_key(signature: &[u8], digest: &[u8; 32]) -> Result<PublicKey, KeyError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(KeyError::InvalidSignature);
    }
    let secp = Secp256k1::new();
    let recovery_id =
        RecoveryId::from_i32(signature[64] as i32).map_err(|_| KeyError::InvalidSignature)?;
    let signature = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| KeyError::InvalidSignature)?;
    let message = Message::from_digest_slice(digest)?;
    Ok(secp.recover_ecdsa(&message, &signature)?)
}

/// X coordinate of the ECDH shared point
pub fn ecdh_x(public_key: &PublicKey, secret_key: &SecretKey) -> [u8; 32] {
    let point = ecdh::shared_secret_point(public_key, secret_key);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}
