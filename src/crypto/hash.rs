//! Hashing utilities for the networking stack
//!
//! Provides Keccak-256 (node distances, handshake secrets, packet hashes),
//! SHA-256 and the NIST SP 800-56 concatenation KDF used by ECIES.

use sha2::Sha256;
use sha3::{Digest, Keccak256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes Keccak-256 hash of the input data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes Keccak-256 over the concatenation of several slices
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Concatenation KDF (NIST SP 800-56A) over SHA-256, empty shared info
pub fn concat_kdf(secret: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len + 32);
    let mut counter: u32 = 1;
    while out.len() < out_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(secret);
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(out_len);
    out
}

/// XOR two equally sized 32 byte values
pub fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        assert_eq!(
            hex::encode(sha256(b"hello world")),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_keccak256() {
        // Keccak-256 of the empty string (differs from SHA3-256)
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(keccak256_concat(&[&b"hello "[..], &b"world"[..]]), keccak256(b"hello world"));
    }

    #[test]
    fn test_concat_kdf_length() {
        let key = concat_kdf(b"shared secret", 32);
        assert_eq!(key.len(), 32);
        assert_eq!(&key[..], &sha256(&[&1u32.to_be_bytes()[..], &b"shared secret"[..]].concat())[..]);
        assert_eq!(concat_kdf(b"shared secret", 48).len(), 48);
    }

    #[test]
    fn test_xor32() {
        let a = [0xffu8; 32];
        let b = [0x0fu8; 32];
        assert_eq!(xor32(&a, &b), [0xf0u8; 32]);
        assert_eq!(xor32(&a, &a), [0u8; 32]);
    }
}
