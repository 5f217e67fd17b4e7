//! The direct peer-to-peer transport.
//!
//! The byte channel itself (a WebRTC data channel, in practice) is
//! established by the peer-connection layer; this transport only writes
//! to it, and fails synchronously when it is not open.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc;
use tracing::debug;

use nightjar_envelope::DeviceId;

use crate::err::TransportError;
use crate::transport::{
    InboundEvent, Packet, StateCell, StateEvents, Transport, TransportKind, TransportPhase,
    TransportState,
};

/// An established byte channel to one peer device.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// True while the channel can carry bytes.
    fn is_open(&self) -> bool;

    /// Write one datagram.
    async fn send_bytes(&self, bytes: &[u8]) -> std::io::Result<()>;
}

/// The set of live peer channels, keyed by device.
///
/// The peer-connection layer owns this; inbound bytes from a channel
/// are injected through [`DirectTransport::inject_inbound`].
pub trait PeerChannels: Send + Sync {
    /// The channel to `device`, if one is established.
    fn channel_for(&self, device: &DeviceId) -> Option<std::sync::Arc<dyn PeerChannel>>;
}

/// Capacity of the inbound event buffer.
const INBOUND_BUFFER: usize = 64;

/// The `directP2P` transport.
pub struct DirectTransport {
    /// Live channels, provided by the peer-connection layer.
    channels: std::sync::Arc<dyn PeerChannels>,
    /// State reporting.
    state: StateCell,
    /// Producer side of the inbound stream.
    inbound_tx: mpsc::Sender<InboundEvent>,
    /// Consumer side, handed out once.
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
}

impl DirectTransport {
    /// Construct over a channel set.
    pub fn new(channels: std::sync::Arc<dyn PeerChannels>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        DirectTransport {
            channels,
            state: StateCell::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Inject an inbound event from the peer-connection layer.
    ///
    /// Returns false when the buffer is full or the consumer is gone.
    pub fn inject_inbound(&self, event: InboundEvent) -> bool {
        self.inbound_tx.clone().try_send(event).is_ok()
    }

    /// Let the peer-connection layer report channel availability; this
    /// drives the observable transport state.
    pub fn note_channel_state(&self, open: bool, detail: Option<&str>) {
        let state = if open {
            TransportState::phase(TransportPhase::Connected)
        } else {
            match detail {
                Some(d) => TransportState::with_detail(TransportPhase::Connecting, d),
                None => TransportState::phase(TransportPhase::Connecting),
            }
        };
        self.state.set(state);
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn start(&self) -> Result<(), TransportError> {
        // Channel establishment happens elsewhere; starting the
        // transport just makes it observable.
        self.state
            .set(TransportState::phase(TransportPhase::Connecting));
        Ok(())
    }

    async fn stop(&self) {
        self.state.set(TransportState::phase(TransportPhase::Idle));
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let Some(channel) = self.channels.channel_for(&packet.to) else {
            return Err(TransportError::ChannelNotOpen);
        };
        if !channel.is_open() {
            return Err(TransportError::ChannelNotOpen);
        }
        channel
            .send_bytes(packet.payload.as_bytes())
            .await
            .map_err(|e| {
                debug!("direct send failed: {}", e);
                TransportError::ChannelNotOpen
            })?;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn state_events(&self) -> StateEvents {
        self.state.events()
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.inbound_rx
            .lock()
            .expect("poisoned inbound lock")
            .take()
    }
}
