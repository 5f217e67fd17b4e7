//! Identifier newtypes used throughout the delivery plane.
//!
//! These are thin: the identity layer hands us opaque device
//! identifiers, and conversation/message ids are only ever compared and
//! used as map keys here.

use std::fmt;

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// An opaque identifier for a single device belonging to some peer.
///
/// The identity layer defines what this means; the delivery plane only
/// routes by it.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Construct a device id from its string form.
    pub fn new(s: impl Into<String>) -> Self {
        DeviceId(s.into())
    }

    /// Return this id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_owned())
    }
}

/// An opaque identifier for a conversation.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConvId(String);

impl ConvId {
    /// Construct a conversation id from its string form.
    pub fn new(s: impl Into<String>) -> Self {
        ConvId(s.into())
    }

    /// Return this id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConvId {
    fn from(s: &str) -> Self {
        ConvId(s.to_owned())
    }
}

/// A globally unique identifier for an outbound message.
///
/// The outbox is keyed by this; at-most-one-in-flight is enforced per
/// `MessageId`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Construct a message id from its string form.
    pub fn new(s: impl Into<String>) -> Self {
        MessageId(s.into())
    }

    /// Generate a fresh random message id.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        MessageId(EventId::generate(rng).to_string())
    }

    /// Return this id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_owned())
    }
}

/// A 128-bit event identifier, rendered as 32 hex digits.
///
/// Every envelope carries one; receivers deduplicate by it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId([u8; 16]);

impl EventId {
    /// Construct an event id from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        EventId(bytes)
    }

    /// Generate a fresh random event id.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0_u8; 16];
        rng.fill_bytes(&mut bytes);
        EventId(bytes)
    }

    /// Return the raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for EventId {
    type Err = BadEventId;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| BadEventId)?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| BadEventId)?;
        Ok(EventId(bytes))
    }
}

/// The string form of an [`EventId`] was not 32 hex digits.
#[derive(Debug, Clone, thiserror::Error)]
#[error("event id was not 32 hex digits")]
#[non_exhaustive]
pub struct BadEventId;

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
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

    #[test]
    fn event_id_roundtrip() {
        let id = EventId::from_bytes(*b"0123456789abcdef");
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        let id2: EventId = s.parse().unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn event_id_rejects_junk() {
        assert!("zz".parse::<EventId>().is_err());
        assert!("abcd".parse::<EventId>().is_err());
        let ok = "00112233445566778899aabbccddeeff".parse::<EventId>();
        assert!(ok.is_ok());
    }

    #[test]
    fn event_id_serde() {
        let id: EventId = "00112233445566778899aabbccddeeff".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00112233445566778899aabbccddeeff\"");
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn generated_ids_differ() {
        let mut rng = rand::rng();
        let a = EventId::generate(&mut rng);
        let b = EventId::generate(&mut rng);
        assert_ne!(a, b);
    }
}
