//! The outbox record and its status machine.

use nightjar_envelope::{ConvId, DeviceId, MessageId};
use serde::{Deserialize, Serialize};

/// Default record time-to-live: seven days.
pub const DEFAULT_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Drain order within a tick: `High` before `Normal`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Priority {
    /// Drained first (control frames, receipts).
    High,
    /// Ordinary messages.
    #[default]
    Normal,
}

/// Where a record is in its lifecycle.
///
/// Transitions are made only by the store, on behalf of the scheduler:
/// `Pending -> InFlight` (claim), `InFlight -> Pending` (retry),
/// `InFlight -> Acked` (terminal, record deleted), and either state
/// `-> Expired` (terminal, record deleted).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RecordStatus {
    /// Waiting for its next attempt.
    Pending,
    /// Claimed by the scheduler; a send may be in progress or an ack may
    /// be outstanding.
    InFlight,
    /// Acknowledged by the recipient.
    Acked,
    /// Gave up: TTL or attempt budget exhausted.
    Expired,
}

/// One persisted outbound message.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct OutboxRecord {
    /// Globally unique message id; the store key.
    pub message_id: MessageId,
    /// Conversation this message belongs to.
    pub conv_id: ConvId,
    /// Destination device.
    pub to_device: DeviceId,
    /// Opaque ciphertext (or serialized envelope) to deliver.
    pub ciphertext: String,
    /// Drain priority.
    #[serde(default)]
    pub priority: Priority,
    /// Creation time, ms since epoch.
    pub created_at_ms: u64,
    /// Hard expiry time, ms since epoch.
    pub expires_at_ms: u64,
    /// Earliest time the next attempt may start.
    pub next_attempt_at_ms: u64,
    /// When the last attempt started, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at_ms: Option<u64>,
    /// Number of attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    /// Lifecycle state.
    pub status: RecordStatus,
    /// When the record was claimed, if it is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_at_ms: Option<u64>,
    /// When an outstanding ack is considered lost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_deadline_ms: Option<u64>,
}

impl OutboxRecord {
    /// Construct a fresh pending record created at `now_ms`.
    pub fn new(
        message_id: MessageId,
        conv_id: ConvId,
        to_device: DeviceId,
        ciphertext: impl Into<String>,
        priority: Priority,
        now_ms: u64,
    ) -> Self {
        OutboxRecord {
            message_id,
            conv_id,
            to_device,
            ciphertext: ciphertext.into(),
            priority,
            created_at_ms: now_ms,
            expires_at_ms: now_ms + DEFAULT_TTL_MS,
            next_attempt_at_ms: now_ms,
            last_attempt_at_ms: None,
            attempts: 0,
            status: RecordStatus::Pending,
            in_flight_at_ms: None,
            ack_deadline_ms: None,
        }
    }

    /// Override the expiry time.
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.expires_at_ms = self.created_at_ms + ttl_ms;
        self
    }

    /// True if the record is past its TTL at `now_ms`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms < now_ms
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

    fn record() -> OutboxRecord {
        OutboxRecord::new(
            MessageId::from("m1"),
            ConvId::from("c1"),
            DeviceId::from("d1"),
            "ct",
            Priority::Normal,
            1_000,
        )
    }

    #[test]
    fn defaults() {
        let r = record();
        assert_eq!(r.status, RecordStatus::Pending);
        assert_eq!(r.attempts, 0);
        assert_eq!(r.next_attempt_at_ms, 1_000);
        assert_eq!(r.expires_at_ms, 1_000 + DEFAULT_TTL_MS);
        assert!(!r.is_expired_at(2_000));
        assert!(r.is_expired_at(1_000 + DEFAULT_TTL_MS + 1));
    }

    #[test]
    fn serde_wire_names() {
        let r = record();
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("messageId").is_some());
        assert!(json.get("convId").is_some());
        assert!(json.get("createdAtMs").is_some());
        assert_eq!(json["status"], "pending");
        assert_eq!(json["priority"], "normal");
        // Unset optionals stay off the wire.
        assert!(json.get("ackDeadlineMs").is_none());
        let back: OutboxRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn priority_orders_high_first() {
        assert!(Priority::High < Priority::Normal);
    }
}
