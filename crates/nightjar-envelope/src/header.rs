//! The authenticated envelope header and its digest.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::{ConvId, DeviceId, EventId};

/// The envelope format version this crate produces and accepts.
pub const ENVELOPE_VERSION: u8 = 1;

/// A SHA-256 digest over a serialized envelope, used to link a
/// conversation's envelopes into a chain.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ChainDigest([u8; 32]);

impl ChainDigest {
    /// Construct a digest from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ChainDigest(bytes)
    }

    /// Return the raw bytes of this digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChainDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for ChainDigest {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainDigest {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("chain digest was not 64 hex digits"))?;
        Ok(ChainDigest(bytes))
    }
}

/// The signed, authenticated header that accompanies every ciphertext.
///
/// The delivery plane reads only this header; the ciphertext body is
/// opaque all the way down to the recipient's ratchet.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct EnvelopeHeader {
    /// Format version; currently always [`ENVELOPE_VERSION`].
    pub v: u8,
    /// Globally unique event identifier; receivers dedup by this.
    #[serde(rename = "eventId")]
    pub event_id: EventId,
    /// The conversation this event belongs to.
    #[serde(rename = "convId")]
    pub conv_id: ConvId,
    /// Sender wall-clock timestamp, in milliseconds since the epoch.
    pub ts: u64,
    /// Monotonic per-conversation counter; strictly increasing per author.
    pub lamport: u64,
    /// The device that authored this envelope.
    #[serde(rename = "authorDeviceId")]
    pub author: DeviceId,
    /// Digest of the previous envelope in this conversation's chain, or
    /// `None` for the first envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<ChainDigest>,
    /// Opaque ratchet header bytes, when a ratchet step accompanies this
    /// envelope.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hex")]
    pub rk: Option<Vec<u8>>,
}

impl EnvelopeHeader {
    /// Construct a header with the current format version and no chain
    /// linkage yet.  [`ChainState::prepare`](crate::ChainState::prepare)
    /// fills in `lamport` and `prev`.
    pub fn new(event_id: EventId, conv_id: ConvId, author: DeviceId, ts: u64) -> Self {
        EnvelopeHeader {
            v: ENVELOPE_VERSION,
            event_id,
            conv_id,
            ts,
            lamport: 0,
            author,
            prev: None,
            rk: None,
        }
    }
}

/// A complete envelope: authenticated header plus opaque ciphertext.
///
/// The ciphertext is carried as a string so that the controller and the
/// transports never have to understand it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Envelope {
    /// The authenticated header.
    #[serde(flatten)]
    pub header: EnvelopeHeader,
    /// The opaque ciphertext body.
    pub ciphertext: String,
}

impl Envelope {
    /// Construct an envelope from its parts.
    pub fn new(header: EnvelopeHeader, ciphertext: impl Into<String>) -> Self {
        Envelope {
            header,
            ciphertext: ciphertext.into(),
        }
    }

    /// Compute the chain digest of this envelope: SHA-256 over its
    /// serialized bytes.
    ///
    /// Serialization of a given envelope is deterministic (fixed field
    /// order, no maps), so both ends compute the same digest.
    pub fn digest(&self) -> ChainDigest {
        let bytes = serde_json::to_vec(self).expect("envelope serialization cannot fail");
        let mut h = Sha256::new();
        h.update(&bytes);
        ChainDigest(h.finalize().into())
    }
}

/// Serde helper: `Option<Vec<u8>>` as an optional hex string.
mod opt_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize optional bytes as hex.
    pub(super) fn serialize<S: Serializer>(
        v: &Option<Vec<u8>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    /// Deserialize optional bytes from hex.
    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        match s {
            Some(s) => hex::decode(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    fn example() -> Envelope {
        let header = EnvelopeHeader::new(
            "00112233445566778899aabbccddeeff".parse().unwrap(),
            ConvId::from("conv-1"),
            DeviceId::from("dev-a"),
            1_700_000_000_000,
        );
        Envelope::new(header, "ct-bytes")
    }

    #[test]
    fn digest_is_stable() {
        let e = example();
        assert_eq!(e.digest(), e.digest());
        let mut e2 = e.clone();
        e2.ciphertext.push('!');
        assert_ne!(e.digest(), e2.digest());
    }

    #[test]
    fn header_serde_field_names() {
        let e = example();
        let json = serde_json::to_value(&e).unwrap();
        // The wire names are the ones the controller and peers expect.
        assert_eq!(json["v"], 1);
        assert!(json.get("eventId").is_some());
        assert!(json.get("convId").is_some());
        assert!(json.get("authorDeviceId").is_some());
        assert!(json.get("prev").is_none());
        assert!(json.get("rk").is_none());

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn rk_roundtrips_as_hex() {
        let mut e = example();
        e.header.rk = Some(vec![1, 2, 255]);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["rk"], "0102ff");
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.header.rk, Some(vec![1, 2, 255]));
    }
}
