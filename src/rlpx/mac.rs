//! Frame encryption and authentication state
//!
//! After the handshake each direction has its own AES-256-CTR key stream
//! and a running Keccak-256 MAC. Header and body MACs are derived by
//! encrypting the current digest with AES-256 under the MAC secret.

use super::ecies::Secrets;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes256, Block};
use sha3::{Digest, Keccak256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Length of header and body MAC tags
pub const MAC_LEN: usize = 16;

/// Running MAC for one direction
pub struct MacState {
    hasher: Keccak256,
    cipher: Aes256,
}

impl MacState {
    pub fn new(mac_secret: &[u8; 32], hasher: Keccak256) -> Self {
        Self {
            hasher,
            cipher: Aes256::new(mac_secret.into()),
        }
    }

    /// First 16 bytes of the current digest
    pub fn digest(&self) -> [u8; MAC_LEN] {
        let full = self.hasher.clone().finalize();
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&full[..MAC_LEN]);
        out
    }

    /// Absorb an encrypted frame header
    pub fn update_header(&mut self, header: &[u8]) {
        let mut seed = self.encrypted_digest();
        for (byte, h) in seed.iter_mut().zip(header) {
            *byte ^= h;
        }
        self.hasher.update(seed);
    }

    /// Absorb an encrypted frame body
    pub fn update_body(&mut self, body: &[u8]) {
        self.hasher.update(body);
        let previous = self.digest();
        let mut seed = self.encrypted_digest();
        for (byte, p) in seed.iter_mut().zip(previous.iter()) {
            *byte ^= p;
        }
        self.hasher.update(seed);
    }

    fn encrypted_digest(&self) -> [u8; MAC_LEN] {
        let mut block = Block::clone_from_slice(&self.digest());
        self.cipher.encrypt_block(&mut block);
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&block);
        out
    }
}

/// Key streams and MACs for both directions of a session
pub struct FrameCipher {
    egress_aes: Aes256Ctr,
    ingress_aes: Aes256Ctr,
    pub(crate) egress_mac: MacState,
    pub(crate) ingress_mac: MacState,
}

impl FrameCipher {
    pub fn new(secrets: Secrets) -> Self {
        let iv = [0u8; 16];
        Self {
            egress_aes: Aes256Ctr::new(&secrets.aes_secret.into(), &iv.into()),
            ingress_aes: Aes256Ctr::new(&secrets.aes_secret.into(), &iv.into()),
            egress_mac: MacState::new(&secrets.mac_secret, secrets.egress_mac),
            ingress_mac: MacState::new(&secrets.mac_secret, secrets.ingress_mac),
        }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.egress_aes.apply_keystream(data);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.ingress_aes.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(seed: &[u8]) -> MacState {
        let mut hasher = Keccak256::new();
        hasher.update(seed);
        MacState::new(&[7u8; 32], hasher)
    }

    #[test]
    fn test_mac_states_agree() {
        let mut sender = state(b"seed");
        let mut receiver = state(b"seed");

        sender.update_header(&[1u8; 16]);
        receiver.update_header(&[1u8; 16]);
        assert_eq!(sender.digest(), receiver.digest());

        sender.update_body(&[2u8; 32]);
        receiver.update_body(&[2u8; 32]);
        assert_eq!(sender.digest(), receiver.digest());
    }

    #[test]
    fn test_mac_depends_on_history() {
        let mut a = state(b"seed");
        let mut b = state(b"seed");

        a.update_header(&[1u8; 16]);
        b.update_header(&[3u8; 16]);
        assert_ne!(a.digest(), b.digest());

        // Diverged states stay diverged even on identical input
        a.update_body(&[0u8; 16]);
        b.update_body(&[0u8; 16]);
        assert_ne!(a.digest(), b.digest());
    }
}
