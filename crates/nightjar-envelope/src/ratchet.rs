//! The abstract ratchet-step interface.
//!
//! The actual key schedule (double ratchet, HKDF, whatever the crypto
//! layer provides) lives outside this crate; the delivery plane only needs
//! "advance the send chain and give me a key", and the symmetric receive
//! operation.

use std::fmt;

/// A symmetric message key produced by a ratchet step.
///
/// Debug output is redacted; keys never appear in logs.
#[derive(Clone, Eq, PartialEq)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    /// Construct a message key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MessageKey(bytes)
    }

    /// Return the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageKey(..)")
    }
}

/// A pluggable per-direction key-derivation step.
///
/// Implementations hold whatever chain-key and header-key state they need;
/// the delivery plane treats that state as a black box.  `next_send_key`
/// must advance the send chain such that successive calls never repeat a
/// key, and the header bytes it returns ride the envelope (`rk`) so the
/// peer's `next_recv_key` can locate the matching receive key.
pub trait RatchetStep: Send {
    /// Advance the send chain, returning the envelope header bytes and the
    /// message key for the next outbound envelope.
    fn next_send_key(&mut self, base_key: &[u8]) -> (Vec<u8>, MessageKey);

    /// Derive the receive key matching `header_bytes`, or `None` if the
    /// header does not correspond to any reachable chain position.
    fn next_recv_key(&mut self, base_key: &[u8], header_bytes: &[u8]) -> Option<MessageKey>;
}
