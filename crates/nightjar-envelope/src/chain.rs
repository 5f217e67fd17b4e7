//! Per-conversation ordering state: lamport clocks and the hash chain.

use std::collections::HashMap;

use crate::header::{ChainDigest, Envelope, EnvelopeHeader, ENVELOPE_VERSION};
use crate::ids::DeviceId;

/// A violation of the conversation ordering invariants.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ChainError {
    /// The envelope carried a version we do not speak.
    #[error("unsupported envelope version {0}")]
    BadVersion(u8),

    /// An author's lamport counter failed to increase.
    #[error("lamport did not increase for {author}: {prev} -> {next}")]
    LamportNotIncreasing {
        /// The author whose counter regressed.
        author: DeviceId,
        /// The highest lamport previously accepted from this author.
        prev: u64,
        /// The lamport value on the offending envelope.
        next: u64,
    },

    /// The envelope's `prev` digest did not match the chain tip.
    #[error("hash chain broken: expected prev {expected:?}, got {got:?}")]
    ChainMismatch {
        /// The digest of the last envelope we accepted, if any.
        expected: Option<ChainDigest>,
        /// The digest the envelope claimed to follow.
        got: Option<ChainDigest>,
    },
}

/// Ordering state for a single conversation.
///
/// One of these exists per conversation on each device.  The *send* half
/// stamps outbound headers with the next lamport value and the current
/// chain tip; the *accept* half validates the same invariants on inbound
/// envelopes.
///
/// Invariants maintained:
///  * `lamport` is strictly increasing per author;
///  * each accepted envelope's `prev` equals the digest of the envelope
///    accepted immediately before it (or is absent for the first).
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    /// Digest of the most recently accepted (or produced) envelope.
    tip: Option<ChainDigest>,
    /// Highest lamport value observed, across all authors.
    clock: u64,
    /// Highest lamport value accepted per author.
    per_author: HashMap<DeviceId, u64>,
}

impl ChainState {
    /// Construct fresh state for a conversation with no history.
    pub fn new() -> Self {
        ChainState::default()
    }

    /// Stamp an outbound header with the next lamport value and the
    /// current chain tip.
    ///
    /// The caller must follow up with [`ChainState::note_sent`] once the
    /// completed envelope exists, so the tip advances.
    pub fn prepare(&mut self, header: &mut EnvelopeHeader) {
        self.clock += 1;
        header.lamport = self.clock;
        header.prev = self.tip;
    }

    /// Record an envelope we just produced, advancing the chain tip.
    pub fn note_sent(&mut self, envelope: &Envelope) {
        self.tip = Some(envelope.digest());
        let entry = self
            .per_author
            .entry(envelope.header.author.clone())
            .or_insert(0);
        *entry = (*entry).max(envelope.header.lamport);
    }

    /// Validate and accept an inbound envelope.
    ///
    /// On success the chain tip and lamport clocks advance; on failure
    /// nothing changes and the envelope must not be applied.
    pub fn accept(&mut self, envelope: &Envelope) -> Result<(), ChainError> {
        let header = &envelope.header;
        if header.v != ENVELOPE_VERSION {
            return Err(ChainError::BadVersion(header.v));
        }
        if header.prev != self.tip {
            return Err(ChainError::ChainMismatch {
                expected: self.tip,
                got: header.prev,
            });
        }
        let last = self.per_author.get(&header.author).copied().unwrap_or(0);
        if header.lamport <= last {
            return Err(ChainError::LamportNotIncreasing {
                author: header.author.clone(),
                prev: last,
                next: header.lamport,
            });
        }

        self.tip = Some(envelope.digest());
        self.clock = self.clock.max(header.lamport);
        self.per_author.insert(header.author.clone(), header.lamport);
        Ok(())
    }

    /// Return the digest of the last envelope in the chain, if any.
    pub fn tip(&self) -> Option<ChainDigest> {
        self.tip
    }

    /// Return the highest lamport value observed so far.
    pub fn clock(&self) -> u64 {
        self.clock
    }
}
