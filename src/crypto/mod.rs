//! Cryptographic utilities for the networking stack
//!
//! This module provides:
//! - Keccak-256 / SHA-256 hashing and the ECIES key derivation function
//! - secp256k1 identity keys, recoverable signatures and ECDH

pub mod hash;
pub mod keys;

pub use hash::{concat_kdf, keccak256, keccak256_concat, sha256, xor32};
pub use keys::{
    ecdh_x, recover_public_key, sign_recoverable, KeyError, KeyPair, NodeId, NODE_ID_LEN,
    SIGNATURE_LEN,
};
