//! RLPx authenticated key exchange
//!
//! - ECIES: secp256k1 ECDH, concat-KDF over SHA-256, AES-128-CTR and an
//!   HMAC-SHA-256 tag
//! - The auth / ack handshake messages and the session secrets derived
//!   from them

use crate::crypto::{
    concat_kdf, ecdh_x, keccak256, keccak256_concat, recover_public_key, sha256, xor32, KeyError,
    KeyPair, NodeId, NODE_ID_LEN, SIGNATURE_LEN,
};
use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, SecretKey};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use thiserror::Error;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const PUBLIC_KEY_LEN: usize = 65;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const NONCE_LEN: usize = 32;

/// Bytes ECIES adds to a plaintext
pub const ECIES_OVERHEAD: usize = PUBLIC_KEY_LEN + IV_LEN + TAG_LEN;

const AUTH_PLAIN_LEN: usize = SIGNATURE_LEN + 32 + NODE_ID_LEN + NONCE_LEN + 1;
const ACK_PLAIN_LEN: usize = NODE_ID_LEN + NONCE_LEN + 1;

/// Size of the encrypted auth message
pub const AUTH_LEN: usize = AUTH_PLAIN_LEN + ECIES_OVERHEAD;

/// Size of the encrypted ack message
pub const ACK_LEN: usize = ACK_PLAIN_LEN + ECIES_OVERHEAD;

/// Handshake errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("ECIES message too short: {0} bytes")]
    TooShort(usize),
    #[error("MAC mismatch")]
    MacMismatch,
    #[error("Invalid auth message: {0}")]
    InvalidAuth(&'static str),
    #[error("Invalid ack message: {0}")]
    InvalidAck(&'static str),
    #[error("Handshake incomplete: missing {0}")]
    Incomplete(&'static str),
    #[error("Cipher initialisation failed")]
    Cipher,
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Secp256k1 error: {0}")]
    Secp256k1(#[from] secp256k1::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encrypt `plaintext` to `remote`: `R || iv || c || tag`
pub fn encrypt(remote: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let ephemeral = KeyPair::generate();
    let (ekey, mkey) = derive_keys(&ecdh_x(remote, &ephemeral.secret_key));
    let iv: [u8; IV_LEN] = rand::random();

    let mut ciphertext = plaintext.to_vec();
    Aes128Ctr::new_from_slices(&ekey, &iv)
        .map_err(|_| HandshakeError::Cipher)?
        .apply_keystream(&mut ciphertext);

    let mut mac = HmacSha256::new_from_slice(&mkey).map_err(|_| HandshakeError::Cipher)?;
    mac.update(&iv);
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(plaintext.len() + ECIES_OVERHEAD);
    out.extend_from_slice(&ephemeral.public_key.serialize_uncompressed());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decrypt an ECIES message addressed to `secret_key`
pub fn decrypt(secret_key: &SecretKey, data: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    if data.len() < ECIES_OVERHEAD {
        return Err(HandshakeError::TooShort(data.len()));
    }

    let ephemeral = PublicKey::from_slice(&data[..PUBLIC_KEY_LEN])?;
    let (ekey, mkey) = derive_keys(&ecdh_x(&ephemeral, secret_key));

    let tag_start = data.len() - TAG_LEN;
    let iv = &data[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + IV_LEN];
    let ciphertext = &data[PUBLIC_KEY_LEN + IV_LEN..tag_start];

    let mut mac = HmacSha256::new_from_slice(&mkey).map_err(|_| HandshakeError::Cipher)?;
    mac.update(iv);
    mac.update(ciphertext);
    mac.verify_slice(&data[tag_start..])
        .map_err(|_| HandshakeError::MacMismatch)?;

    let mut plaintext = ciphertext.to_vec();
    Aes128Ctr::new_from_slices(&ekey, iv)
        .map_err(|_| HandshakeError::Cipher)?
        .apply_keystream(&mut plaintext);
    Ok(plaintext)
}

fn derive_keys(shared: &[u8; 32]) -> ([u8; 16], [u8; 32]) {
    let key = concat_kdf(shared, 32);
    let mut ekey = [0u8; 16];
    ekey.copy_from_slice(&key[..16]);
    (ekey, sha256(&key[16..32]))
}

/// Secrets shared by both ends once the handshake completes
pub struct Secrets {
    pub remote_id: NodeId,
    pub aes_secret: [u8; 32],
    pub mac_secret: [u8; 32],
    /// Running MAC over everything we send
    pub egress_mac: Keccak256,
    /// Running MAC over everything we receive
    pub ingress_mac: Keccak256,
}

/// State of one side of the auth / ack exchange
pub struct Handshake {
    key: KeyPair,
    ephemeral: KeyPair,
    nonce: [u8; NONCE_LEN],
    initiator: bool,
    remote_id: Option<NodeId>,
    remote_ephemeral: Option<PublicKey>,
    remote_nonce: Option<[u8; NONCE_LEN]>,
    auth: Option<Vec<u8>>,
    ack: Option<Vec<u8>>,
}

impl Handshake {
    /// Dialing side; the remote id is known from discovery
    pub fn initiator(key: KeyPair, remote_id: NodeId) -> Self {
        let mut handshake = Self::new(key, true);
        handshake.remote_id = Some(remote_id);
        handshake
    }

    /// Accepting side; the remote id is learned from the auth message
    pub fn responder(key: KeyPair) -> Self {
        Self::new(key, false)
    }

    fn new(key: KeyPair, initiator: bool) -> Self {
        Self {
            key,
            ephemeral: KeyPair::generate(),
            nonce: rand::random(),
            initiator,
            remote_id: None,
            remote_ephemeral: None,
            remote_nonce: None,
            auth: None,
            ack: None,
        }
    }

    pub fn remote_id(&self) -> Option<NodeId> {
        self.remote_id
    }

    /// Build the encrypted auth message
    pub fn create_auth(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let remote_id = self.remote_id.ok_or(HandshakeError::Incomplete("remote id"))?;
        let remote_key = remote_id.to_public_key()?;

        let static_shared = self.key.ecdh(&remote_key);
        let signature = self
            .ephemeral
            .sign_recoverable(&xor32(&static_shared, &self.nonce))?;

        let mut plain = Vec::with_capacity(AUTH_PLAIN_LEN);
        plain.extend_from_slice(&signature);
        plain.extend_from_slice(&self.ephemeral.node_id().hash());
        plain.extend_from_slice(self.key.node_id().as_bytes());
        plain.extend_from_slice(&self.nonce);
        plain.push(0x00);

        let auth = encrypt(&remote_key, &plain)?;
        self.auth = Some(auth.clone());
        Ok(auth)
    }

    /// Authenticate the initiator from its auth message
    pub fn parse_auth(&mut self, data: &[u8]) -> Result<(), HandshakeError> {
        if data.len() != AUTH_LEN {
            return Err(HandshakeError::InvalidAuth("unexpected size"));
        }
        let plain = decrypt(&self.key.secret_key, data)?;
        if plain.len() != AUTH_PLAIN_LEN {
            return Err(HandshakeError::InvalidAuth("unexpected size"));
        }

        let signature = &plain[..SIGNATURE_LEN];
        let ephemeral_hash = &plain[SIGNATURE_LEN..SIGNATURE_LEN + 32];
        let id_start = SIGNATURE_LEN + 32;
        let remote_id = NodeId::from_slice(&plain[id_start..id_start + NODE_ID_LEN])?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&plain[id_start + NODE_ID_LEN..id_start + NODE_ID_LEN + NONCE_LEN]);

        let static_shared = self.key.ecdh(&remote_id.to_public_key()?);
        let remote_ephemeral = recover_public_key(signature, &xor32(&static_shared, &nonce))
            .map_err(|_| HandshakeError::InvalidAuth("bad signature"))?;

        if keccak256(NodeId::from_public_key(&remote_ephemeral).as_bytes())[..] != *ephemeral_hash {
            return Err(HandshakeError::InvalidAuth("ephemeral key hash mismatch"));
        }

        self.remote_id = Some(remote_id);
        self.remote_ephemeral = Some(remote_ephemeral);
        self.remote_nonce = Some(nonce);
        self.auth = Some(data.to_vec());
        Ok(())
    }

    /// Build the encrypted ack message
    pub fn create_ack(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let remote_id = self.remote_id.ok_or(HandshakeError::Incomplete("auth"))?;

        let mut plain = Vec::with_capacity(ACK_PLAIN_LEN);
        plain.extend_from_slice(self.ephemeral.node_id().as_bytes());
        plain.extend_from_slice(&self.nonce);
        plain.push(0x00);

        let ack = encrypt(&remote_id.to_public_key()?, &plain)?;
        self.ack = Some(ack.clone());
        Ok(ack)
    }

    pub fn parse_ack(&mut self, data: &[u8]) -> Result<(), HandshakeError> {
        if data.len() != ACK_LEN {
            return Err(HandshakeError::InvalidAck("unexpected size"));
        }
        let plain = decrypt(&self.key.secret_key, data)?;
        if plain.len() != ACK_PLAIN_LEN {
            return Err(HandshakeError::InvalidAck("unexpected size"));
        }

        let remote_ephemeral = NodeId::from_slice(&plain[..NODE_ID_LEN])?
            .to_public_key()
            .map_err(|_| HandshakeError::InvalidAck("bad ephemeral key"))?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&plain[NODE_ID_LEN..NODE_ID_LEN + NONCE_LEN]);

        self.remote_ephemeral = Some(remote_ephemeral);
        self.remote_nonce = Some(nonce);
        self.ack = Some(data.to_vec());
        Ok(())
    }

    /// Derive the session secrets; both messages must have been exchanged
    pub fn secrets(&self) -> Result<Secrets, HandshakeError> {
        let remote_id = self.remote_id.ok_or(HandshakeError::Incomplete("remote id"))?;
        let remote_ephemeral = self
            .remote_ephemeral
            .ok_or(HandshakeError::Incomplete("remote ephemeral key"))?;
        let remote_nonce = self.remote_nonce.ok_or(HandshakeError::Incomplete("remote nonce"))?;
        let auth = self.auth.as_ref().ok_or(HandshakeError::Incomplete("auth"))?;
        let ack = self.ack.as_ref().ok_or(HandshakeError::Incomplete("ack"))?;

        let ephemeral_shared = self.ephemeral.ecdh(&remote_ephemeral);
        let (initiator_nonce, recipient_nonce) = if self.initiator {
            (self.nonce, remote_nonce)
        } else {
            (remote_nonce, self.nonce)
        };

        let nonce_hash = keccak256_concat(&[&recipient_nonce, &initiator_nonce]);
        let shared_secret = keccak256_concat(&[&ephemeral_shared, &nonce_hash]);
        let aes_secret = keccak256_concat(&[&ephemeral_shared, &shared_secret]);
        let mac_secret = keccak256_concat(&[&ephemeral_shared, &aes_secret]);

        let (sent, received) = if self.initiator { (auth, ack) } else { (ack, auth) };

        let mut egress_mac = Keccak256::new();
        egress_mac.update(xor32(&mac_secret, &remote_nonce));
        egress_mac.update(sent);

        let mut ingress_mac = Keccak256::new();
        ingress_mac.update(xor32(&mac_secret, &self.nonce));
        ingress_mac.update(received);

        Ok(Secrets {
            remote_id,
            aes_secret,
            mac_secret,
            egress_mac,
            ingress_mac,
        })
    }
}
