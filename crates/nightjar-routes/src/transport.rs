//! The uniform transport surface.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use postage::watch;
use serde_json::Value;

use nightjar_envelope::{DeviceId, MessageId};

use crate::err::TransportError;

/// Which transport a value refers to.
///
/// The router addresses transports by kind; no downcasting anywhere.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum TransportKind {
    /// The established peer-to-peer byte channel.
    Direct,
    /// The internally built multi-hop onion path.
    SelfOnion,
    /// The Tor/Lokinet path via the local controller.
    OnionRouter,
}

impl TransportKind {
    /// Stable name, used in logs and health reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Direct => "directP2P",
            TransportKind::SelfOnion => "selfOnion",
            TransportKind::OnionRouter => "onionRouter",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Connection phase of a transport, per conversation-independent view.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum TransportPhase {
    /// Not started.
    #[default]
    Idle,
    /// Trying to come up.
    Connecting,
    /// Usable.
    Connected,
    /// Usable but recently failing.
    Degraded,
    /// Not usable.
    Failed,
}

/// Phase plus free-form detail.
#[derive(Debug, Clone, Default, PartialEq)]
#[non_exhaustive]
pub struct TransportState {
    /// The phase.
    pub phase: TransportPhase,
    /// Human-readable detail.
    pub detail: Option<String>,
}

impl TransportState {
    /// Construct a state with no detail.
    pub fn phase(phase: TransportPhase) -> Self {
        TransportState {
            phase,
            detail: None,
        }
    }

    /// Construct a state with detail.
    pub fn with_detail(phase: TransportPhase, detail: impl Into<String>) -> Self {
        TransportState {
            phase,
            detail: Some(detail.into()),
        }
    }
}

/// One outbound unit: the outbox record's id plus its opaque payload.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Packet {
    /// The outbox record id (acks refer to this).
    pub id: MessageId,
    /// Destination device.
    pub to: DeviceId,
    /// Opaque payload (serialized envelope).
    pub payload: String,
}

impl Packet {
    /// Construct a packet.
    pub fn new(id: MessageId, to: DeviceId, payload: impl Into<String>) -> Self {
        Packet {
            id,
            to,
            payload: payload.into(),
        }
    }
}

/// Something a transport delivered upward.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum InboundEvent {
    /// An envelope arrived.
    Message {
        /// Transport-level item id (used for dedup at the poller).
        id: String,
        /// Claimed sender, when the substrate knows.
        from: Option<DeviceId>,
        /// The opaque envelope.
        envelope: Value,
    },
    /// The peer acknowledged one of our messages.
    Ack {
        /// The acknowledged outbox record.
        of: MessageId,
    },
}

/// A stream of [`TransportState`] values with replay of the latest.
#[derive(Clone)]
pub struct StateEvents {
    /// The receiver implementing this stream.
    inner: watch::Receiver<TransportState>,
}

impl Stream for StateEvents {
    type Item = TransportState;
    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Shared state-reporting plumbing used by every transport.
#[derive(Debug)]
pub(crate) struct StateCell {
    /// Broadcast side.
    tx: Mutex<watch::Sender<TransportState>>,
    /// Template receiver.
    rx: watch::Receiver<TransportState>,
}

impl StateCell {
    /// Construct, starting in `Idle`.
    pub(crate) fn new() -> Self {
        let (tx, rx) = watch::channel();
        StateCell {
            tx: Mutex::new(tx),
            rx,
        }
    }

    /// Publish a new state.
    pub(crate) fn set(&self, state: TransportState) {
        *self
            .tx
            .lock()
            .expect("poisoned transport state lock")
            .borrow_mut() = state;
    }

    /// The current state.
    pub(crate) fn get(&self) -> TransportState {
        self.rx.borrow().clone()
    }

    /// Subscribe with replay.
    pub(crate) fn events(&self) -> StateEvents {
        StateEvents {
            inner: self.rx.clone(),
        }
    }
}

/// The capability set every transport implements.
///
/// `take_inbound()` hands out the single consumer end of the
/// transport's inbound event stream; the router takes it once at wiring
/// time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Bring the transport up.  Idempotent.
    async fn start(&self) -> Result<(), TransportError>;

    /// Tear the transport down.
    async fn stop(&self);

    /// Send one packet.
    async fn send(&self, packet: &Packet) -> Result<(), TransportError>;

    /// Current state snapshot.
    fn state(&self) -> TransportState;

    /// Subscribe to state changes (latest value replayed).
    fn state_events(&self) -> StateEvents;

    /// The inbound event stream; `None` after the first call.
    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundEvent>>;
}
