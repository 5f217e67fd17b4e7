//! Friend-control frames and read-cursor receipts.
//!
//! These ride the same delivery pipeline as ordinary messages; the router
//! never looks inside them.  Bodies are signed with the sender's identity
//! key, and a receiver validates the signature against the pinned identity
//! key from the friend profile *before* applying any state change.

use serde::{Deserialize, Serialize};

use crate::ids::{ConvId, DeviceId, EventId};

/// A control event exchanged between friends.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
#[non_exhaustive]
pub enum ControlFrame {
    /// Ask a peer to become a friend.
    FriendRequest {
        /// Our identity public key, for the peer to pin.
        #[serde(rename = "identityKey", with = "hex_bytes")]
        identity_key: Vec<u8>,
        /// Our DH public key for the initial exchange.
        #[serde(rename = "dhKey", with = "hex_bytes")]
        dh_key: Vec<u8>,
        /// Free-form display name; the presentation layer renders it.
        #[serde(rename = "displayName")]
        display_name: String,
    },
    /// Accept a pending friend request.
    FriendAccept {
        /// Our DH public key, completing the exchange.
        #[serde(rename = "dhKey", with = "hex_bytes")]
        dh_key: Vec<u8>,
    },
    /// Decline a pending friend request.
    FriendDecline {},
    /// Advance the read cursor for a conversation.
    ReadCursor {
        /// The conversation being acknowledged.
        #[serde(rename = "convId")]
        conv_id: ConvId,
        /// The last event the reader has seen.
        #[serde(rename = "upTo")]
        up_to: EventId,
        /// Reader wall-clock timestamp, ms.
        ts: u64,
    },
}

impl ControlFrame {
    /// Serialize this frame to its canonical byte form (the bytes that
    /// get signed).
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("control frame serialization cannot fail")
    }

    /// Parse a frame from its canonical byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ControlFrameError> {
        serde_json::from_slice(bytes).map_err(|_| ControlFrameError::Malformed)
    }
}

/// Something that can sign control-frame bodies with our identity key.
///
/// The identity layer implements this; we never see the private key.
pub trait FrameSigner: Send + Sync {
    /// Produce a detached signature over `body`.
    fn sign(&self, body: &[u8]) -> Vec<u8>;
}

/// Something that can verify a peer's control-frame signature against a
/// pinned identity key.
pub trait FrameVerifier: Send + Sync {
    /// Return true iff `sig` is a valid signature by `pinned_identity_key`
    /// over `body`.
    fn verify(&self, pinned_identity_key: &[u8], body: &[u8], sig: &[u8]) -> bool;
}

/// A control frame together with its author and signature, as it travels
/// inside an envelope ciphertext slot.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SignedControl {
    /// The device that produced (and signed) the frame.
    pub author: DeviceId,
    /// Canonical frame bytes.
    #[serde(with = "hex_bytes")]
    pub body: Vec<u8>,
    /// Detached signature over `body` by the author's identity key.
    #[serde(with = "hex_bytes")]
    pub sig: Vec<u8>,
}

impl SignedControl {
    /// Sign `frame` as `author`.
    pub fn sign<S: FrameSigner + ?Sized>(author: DeviceId, frame: &ControlFrame, signer: &S) -> Self {
        let body = frame.to_bytes();
        let sig = signer.sign(&body);
        SignedControl { author, body, sig }
    }

    /// Verify the signature against the pinned identity key and, on
    /// success, decode the inner frame.
    ///
    /// A bad signature yields an error and *no* frame: callers must not
    /// apply state changes from unverified frames.
    pub fn verify<V: FrameVerifier + ?Sized>(
        &self,
        verifier: &V,
        pinned_identity_key: &[u8],
    ) -> Result<ControlFrame, ControlFrameError> {
        if !verifier.verify(pinned_identity_key, &self.body, &self.sig) {
            return Err(ControlFrameError::BadSignature {
                author: self.author.clone(),
            });
        }
        ControlFrame::from_bytes(&self.body)
    }
}

/// An error encountered while handling a control frame.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ControlFrameError {
    /// The frame's signature did not verify against the pinned key.
    #[error("control frame from {author} failed signature validation")]
    BadSignature {
        /// The claimed author.
        author: DeviceId,
    },

    /// The frame body was not a recognized control frame.
    #[error("malformed control frame body")]
    Malformed,
}

/// Serde helper: `Vec<u8>` as a hex string.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as hex.
    pub(super) fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    /// Deserialize bytes from hex.
    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
