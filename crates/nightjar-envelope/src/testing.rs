//! Deterministic test doubles for the crypto seams.
//!
//! Nothing here is cryptographically sound; these exist so that other
//! crates' tests can exercise the delivery plane without a real identity
//! or ratchet layer.

use sha2::{Digest, Sha256};

use crate::control::{FrameSigner, FrameVerifier};
use crate::ratchet::{MessageKey, RatchetStep};

/// A "signer" whose signature is a hash of the key and the body.
///
/// The same object verifies: a signature checks out iff it was produced
/// with the same key bytes.
#[derive(Debug, Clone)]
pub struct StaticSigner {
    /// The stand-in identity key.
    key: Vec<u8>,
}

impl StaticSigner {
    /// Construct a signer around stand-in key bytes.
    pub fn new(key: &[u8]) -> Self {
        StaticSigner { key: key.to_vec() }
    }

    /// Hash `key || body`.
    fn mac(key: &[u8], body: &[u8]) -> Vec<u8> {
        let mut h = Sha256::new();
        h.update(key);
        h.update(body);
        h.finalize().to_vec()
    }
}

impl FrameSigner for StaticSigner {
    fn sign(&self, body: &[u8]) -> Vec<u8> {
        Self::mac(&self.key, body)
    }
}

impl FrameVerifier for StaticSigner {
    fn verify(&self, pinned_identity_key: &[u8], body: &[u8], sig: &[u8]) -> bool {
        Self::mac(pinned_identity_key, body) == sig
    }
}

/// A counter-based ratchet: each step hashes the base key with a counter.
///
/// The header bytes are the big-endian counter, so the receive side can
/// derive the matching key for any step it has not yet consumed.
#[derive(Debug, Default)]
pub struct TestRatchet {
    /// Number of send steps taken so far.
    send_counter: u64,
}

impl TestRatchet {
    /// Construct a fresh test ratchet.
    pub fn new() -> Self {
        TestRatchet::default()
    }

    /// Derive the key for a given chain position.
    fn key_at(base_key: &[u8], counter: u64) -> MessageKey {
        let mut h = Sha256::new();
        h.update(base_key);
        h.update(counter.to_be_bytes());
        MessageKey::from_bytes(h.finalize().into())
    }
}

impl RatchetStep for TestRatchet {
    fn next_send_key(&mut self, base_key: &[u8]) -> (Vec<u8>, MessageKey) {
        self.send_counter += 1;
        let key = Self::key_at(base_key, self.send_counter);
        (self.send_counter.to_be_bytes().to_vec(), key)
    }

    fn next_recv_key(&mut self, base_key: &[u8], header_bytes: &[u8]) -> Option<MessageKey> {
        let counter: [u8; 8] = header_bytes.try_into().ok()?;
        let counter = u64::from_be_bytes(counter);
        if counter == 0 {
            return None;
        }
        Some(Self::key_at(base_key, counter))
    }
}
