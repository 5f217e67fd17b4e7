//! The self-built multi-hop onion transport.
//!
//! Peers cooperatively relay for each other; a path of (by default)
//! three hops is built through volunteer relays.  The hop *wire*
//! protocol lives behind [`HopCircuitBuilder`]; it belongs to the
//! relay side.  The route lifecycle, rebuild-on-failure behavior, and
//! readiness gating are all this module's job.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use tracing::{debug, info, warn};

use nightjar_envelope::DeviceId;

use crate::err::TransportError;
use crate::transport::{
    InboundEvent, Packet, StateCell, StateEvents, Transport, TransportKind, TransportPhase,
    TransportState,
};

/// Identifies one volunteer relay.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RelayId(String);

impl RelayId {
    /// Construct a relay id.
    pub fn new(s: impl Into<String>) -> Self {
        RelayId(s.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Where candidate relays come from.
pub trait RelayDirectory: Send + Sync {
    /// Up to `n` distinct relay candidates, best first.
    fn candidates(&self, n: usize) -> Vec<RelayId>;
}

/// An error from the hop machinery.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum HopError {
    /// Not enough relays volunteered.
    #[error("not enough relays: wanted {wanted}, had {available}")]
    NotEnoughRelays {
        /// Hops requested.
        wanted: usize,
        /// Relays on offer.
        available: usize,
    },
    /// A specific hop failed to extend or relay.
    #[error("hop {relay} failed: {detail}")]
    HopFailed {
        /// The failing relay (rendered id).
        relay: String,
        /// What happened.
        detail: String,
    },
}

/// A built path, ready to carry payloads.
#[async_trait]
pub trait HopCircuit: Send + Sync {
    /// Send a payload to its final destination through the path.
    async fn send_through(&self, to: &DeviceId, payload: &[u8]) -> Result<(), HopError>;
}

/// Builds hop circuits; the concrete wire protocol lives behind this.
#[async_trait]
pub trait HopCircuitBuilder: Send + Sync {
    /// Build a circuit through exactly `hops`.
    async fn build(&self, hops: &[RelayId]) -> Result<Arc<dyn HopCircuit>, HopError>;
}

/// Configuration for the self-onion transport.
#[derive(Debug, Clone)]
pub struct SelfOnionConfig {
    /// Desired hop count.
    pub hops: usize,
}

impl Default for SelfOnionConfig {
    fn default() -> Self {
        SelfOnionConfig { hops: 3 }
    }
}

/// Route lifecycle.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum RouteState {
    /// Nothing built.
    Idle,
    /// A build is in progress.
    Building,
    /// The path is usable.
    Ready,
    /// A hop failed; a rebuild is warranted.
    Degraded,
    /// The path was torn down.
    Expired,
}

/// Capacity of the inbound event buffer.
const INBOUND_BUFFER: usize = 64;

/// The `selfOnion` transport.
pub struct SelfOnionTransport {
    /// Source of relay candidates.
    relays: Arc<dyn RelayDirectory>,
    /// Circuit construction.
    builder: Arc<dyn HopCircuitBuilder>,
    /// Configuration.
    config: SelfOnionConfig,
    /// Lifecycle state plus the live circuit.
    route: Mutex<(RouteState, Option<Arc<dyn HopCircuit>>)>,
    /// Observable state.
    state: StateCell,
    /// Producer side of the inbound stream (relayed envelopes arrive
    /// from the relay layer through `inject_inbound`).
    inbound_tx: mpsc::Sender<InboundEvent>,
    /// Consumer side, handed out once.
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
}

impl SelfOnionTransport {
    /// Construct over a relay directory and circuit builder.
    pub fn new(
        relays: Arc<dyn RelayDirectory>,
        builder: Arc<dyn HopCircuitBuilder>,
        config: SelfOnionConfig,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        SelfOnionTransport {
            relays,
            builder,
            config,
            route: Mutex::new((RouteState::Idle, None)),
            state: StateCell::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Inject an inbound event from the relay layer.
    pub fn inject_inbound(&self, event: InboundEvent) -> bool {
        self.inbound_tx.clone().try_send(event).is_ok()
    }

    /// True when sends may proceed.
    pub fn is_ready(&self) -> bool {
        self.route.lock().expect("poisoned route lock").0 == RouteState::Ready
    }

    /// (Re)build the hop path.
    async fn build_route(&self) -> Result<(), TransportError> {
        {
            let mut route = self.route.lock().expect("poisoned route lock");
            if route.0 == RouteState::Building {
                // A build is already running; let it finish.
                return Ok(());
            }
            *route = (RouteState::Building, None);
        }
        self.state
            .set(TransportState::with_detail(TransportPhase::Connecting, "building route"));

        let wanted = self.config.hops;
        let hops = self.relays.candidates(wanted);
        if hops.len() < wanted {
            let detail = format!("need {wanted} relays, have {}", hops.len());
            warn!("self-onion build impossible: {}", detail);
            *self.route.lock().expect("poisoned route lock") = (RouteState::Idle, None);
            self.state
                .set(TransportState::with_detail(TransportPhase::Failed, detail));
            return Err(TransportError::RouteNotReady);
        }

        match self.builder.build(&hops[..wanted]).await {
            Ok(circuit) => {
                info!("self-onion route ready ({} hops)", wanted);
                *self.route.lock().expect("poisoned route lock") =
                    (RouteState::Ready, Some(circuit));
                self.state
                    .set(TransportState::phase(TransportPhase::Connected));
                Ok(())
            }
            Err(e) => {
                warn!("self-onion build failed: {}", e);
                *self.route.lock().expect("poisoned route lock") = (RouteState::Idle, None);
                self.state
                    .set(TransportState::with_detail(TransportPhase::Failed, e.to_string()));
                Err(TransportError::RouteNotReady)
            }
        }
    }

    /// Mark the route degraded after a hop failure and rebuild.
    async fn degrade_and_rebuild(&self, reason: &HopError) {
        debug!("self-onion hop failure: {}; rebuilding", reason);
        *self.route.lock().expect("poisoned route lock") = (RouteState::Degraded, None);
        self.state.set(TransportState::with_detail(
            TransportPhase::Degraded,
            reason.to_string(),
        ));
        let _ = self.build_route().await;
    }
}

#[async_trait]
impl Transport for SelfOnionTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SelfOnion
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.is_ready() {
            return Ok(());
        }
        self.build_route().await
    }

    async fn stop(&self) {
        *self.route.lock().expect("poisoned route lock") = (RouteState::Expired, None);
        self.state.set(TransportState::phase(TransportPhase::Idle));
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let circuit = {
            let route = self.route.lock().expect("poisoned route lock");
            match (&route.0, &route.1) {
                (RouteState::Ready, Some(circuit)) => Arc::clone(circuit),
                _ => return Err(TransportError::RouteNotReady),
            }
        };
        match circuit
            .send_through(&packet.to, packet.payload.as_bytes())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.degrade_and_rebuild(&e).await;
                Err(TransportError::RouteNotReady)
            }
        }
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
