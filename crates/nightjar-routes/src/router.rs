//! The router: persist, pick a transport, send, reconcile acks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::SelectAll;
use futures::task::SpawnExt;
use futures::StreamExt;
use serde_json::{json, Value};
use tor_rtcompat::Runtime;
use tracing::{debug, info, warn};

use nightjar_envelope::{ConvId, DeviceId, MessageId};
use nightjar_netcfg::NetConfigStore;
use nightjar_outbox::{
    OutboxRecord, OutboxStore, Priority, Scheduler, SchedulerConfig, SchedulerHandle,
    SendAttemptError, SendDriver,
};

use crate::peers::PeerDirectory;
use crate::route_ctrl::{RouteContext, RouteController};
use crate::transport::{InboundEvent, Packet, Transport, TransportKind, TransportPhase};

/// Capacity of the app-facing delivery buffer.
const DELIVERY_BUFFER: usize = 256;

/// One outbound request from the application layer.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Conversation this message belongs to.
    pub conv_id: ConvId,
    /// Destination device, when the friend code resolved one.
    pub to_device: Option<DeviceId>,
    /// The opaque serialized envelope.
    pub ciphertext: String,
    /// Drain priority.
    pub priority: Priority,
    /// Message id; defaults to the envelope's event id by convention so
    /// that remote acks can name it.
    pub message_id: MessageId,
    /// TTL override, ms.
    pub ttl_ms: Option<u64>,
}

/// A router-level failure.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RouterError {
    /// The request named no destination device.
    #[error("destination device is missing")]
    MissingDestinationTo,

    /// We have no keys (no friend profile) for the destination.
    #[error("peer keys missing for {0}")]
    MissingPeerKeys(DeviceId),

    /// The outbox refused the record.
    #[error("could not persist outbound message")]
    Store(#[from] nightjar_outbox::StoreError),
}

impl RouterError {
    /// The stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::MissingDestinationTo => "missing_destination_to",
            RouterError::MissingPeerKeys(_) => "missing_peer_keys",
            RouterError::Store(_) => "send_failed",
        }
    }
}

/// An envelope handed up to the application layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct InboundDelivery {
    /// Claimed sender, when known.
    pub from: Option<DeviceId>,
    /// The opaque envelope.
    pub envelope: Value,
}

/// The per-send orchestrator.
///
/// Owns no outbound state itself: the outbox store is the single source
/// of truth, and this type only coordinates it with the transports.
pub struct Router<R: Runtime> {
    /// Runtime for spawning.
    runtime: R,
    /// The durable outbox.
    store: Arc<OutboxStore>,
    /// Peer routing hints.
    peers: Arc<PeerDirectory>,
    /// Policy and health.
    route_ctrl: Arc<RouteController>,
    /// Live network policy.
    netcfg: Arc<NetConfigStore>,
    /// The registered transports.
    transports: Mutex<HashMap<TransportKind, Arc<dyn Transport>>>,
    /// The running scheduler, once launched.
    scheduler: Mutex<Option<SchedulerHandle>>,
    /// Producer side of the delivery stream.
    delivery_tx: mpsc::Sender<InboundDelivery>,
    /// Consumer side, handed out once.
    delivery_rx: Mutex<Option<mpsc::Receiver<InboundDelivery>>>,
}

impl<R: Runtime> Router<R> {
    /// Construct a router.
    pub fn new(
        runtime: R,
        store: Arc<OutboxStore>,
        peers: Arc<PeerDirectory>,
        route_ctrl: Arc<RouteController>,
        netcfg: Arc<NetConfigStore>,
    ) -> Arc<Self> {
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_BUFFER);
        Arc::new(Router {
            runtime,
            store,
            peers,
            route_ctrl,
            netcfg,
            transports: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(None),
            delivery_tx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
        })
    }

    /// Register a transport.  Call before [`launch`](Self::launch).
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .lock()
            .expect("poisoned transports lock")
            .insert(transport.kind(), transport);
    }

    /// The app-facing delivery stream; `None` after the first call.
    pub fn take_deliveries(&self) -> Option<mpsc::Receiver<InboundDelivery>> {
        self.delivery_rx
            .lock()
            .expect("poisoned delivery lock")
            .take()
    }

    /// Validate, persist, and schedule one outbound message.
    pub fn queue_send(&self, request: SendRequest) -> Result<MessageId, RouterError> {
        let to_device = request
            .to_device
            .clone()
            .ok_or(RouterError::MissingDestinationTo)?;
        let known_keys = self
            .peers
            .get(&to_device)
            .map(|h| h.identity_key.is_some())
            .unwrap_or(false);
        if !known_keys {
            return Err(RouterError::MissingPeerKeys(to_device));
        }

        let now = now_ms(&self.runtime);
        let mut record = OutboxRecord::new(
            request.message_id.clone(),
            request.conv_id,
            to_device,
            request.ciphertext,
            request.priority,
            now,
        );
        if let Some(ttl) = request.ttl_ms {
            record = record.with_ttl_ms(ttl);
        }
        self.store.put(record)?;
        debug!("queued outbound message {}", request.message_id);

        if let Some(handle) = self.scheduler.lock().expect("poisoned scheduler lock").as_ref() {
            handle.wake();
        }
        Ok(request.message_id)
    }

    /// An ack arrived out of band (e.g. from the direct channel glue).
    pub fn note_ack(&self, id: &MessageId) {
        match self.store.note_ack(id) {
            Ok(true) => info!("message {} acknowledged", id),
            Ok(false) => debug!("duplicate ack for {}", id),
            Err(e) => warn!("could not apply ack for {}: {}", id, e),
        }
    }

    /// Launch the outbox scheduler and the inbound pump.
    pub fn launch(
        self: &Arc<Self>,
        config: SchedulerConfig,
    ) -> Result<SchedulerHandle, futures::task::SpawnError> {
        // Inbound pump: merge every transport's event stream.
        let mut streams: SelectAll<mpsc::Receiver<InboundEvent>> = SelectAll::new();
        {
            let transports = self.transports.lock().expect("poisoned transports lock");
            for transport in transports.values() {
                if let Some(rx) = transport.take_inbound() {
                    streams.push(rx);
                }
            }
        }
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            this.inbound_pump(streams).await;
        })?;

        let driver = Arc::new(RouteDriver {
            router: Arc::clone(self),
        });
        let scheduler = Scheduler::new(
            self.runtime.clone(),
            Arc::clone(&self.store),
            driver,
            config,
        );
        let handle = scheduler.launch()?;
        *self.scheduler.lock().expect("poisoned scheduler lock") = Some(handle.clone());
        Ok(handle)
    }

    /// Consume merged inbound events: deliver messages upward (with
    /// event-level dedup), apply acks, and answer messages with acks.
    async fn inbound_pump(self: Arc<Self>, mut events: SelectAll<mpsc::Receiver<InboundEvent>>) {
        let mut seen = nightjar_envelope::SeenEvents::new();
        let mut delivery_tx = self.delivery_tx.clone();
        while let Some(event) = events.next().await {
            match event {
                InboundEvent::Ack { of } => {
                    self.note_ack(&of);
                }
                InboundEvent::Message { id, from, envelope } => {
                    // Second-layer dedup by envelope event id, when one
                    // is present and well-formed.
                    if let Some(event_id) = envelope["eventId"]
                        .as_str()
                        .and_then(|s| s.parse::<nightjar_envelope::EventId>().ok())
                    {
                        if !seen.insert(event_id) {
                            debug!("dropping duplicate event {}", event_id);
                            continue;
                        }
                    }
                    if let Some(from) = from.clone() {
                        self.ack_best_effort(from, &id);
                    }
                    if delivery_tx
                        .try_send(InboundDelivery { from, envelope })
                        .is_err()
                    {
                        warn!("delivery buffer full; dropping inbound envelope");
                    }
                }
            }
        }
        debug!("inbound pump exiting");
    }

    /// Fire-and-forget an ack for inbox item `of` back to `to`.
    ///
    /// Losing an ack is harmless: the sender retries the message, the
    /// dedup layer drops the duplicate, and a fresh ack goes out.
    fn ack_best_effort(self: &Arc<Self>, to: DeviceId, of: &str) {
        let payload = json!({"kind": "ack", "ackOf": of}).to_string();
        let packet = Packet::new(MessageId::from(format!("ack-{of}").as_str()), to, payload);
        let this = Arc::clone(self);
        let spawned = self.runtime.spawn(async move {
            let routes = this.ordered_routes(&packet.to);
            for kind in routes {
                let transport = this.transport(kind);
                let Some(transport) = transport else { continue };
                match transport.send(&packet).await {
                    Ok(()) => return,
                    Err(e) => debug!("ack via {} failed: {}", kind, e),
                }
            }
            debug!("could not deliver ack for {}", packet.id);
        });
        if let Err(e) = spawned {
            warn!("could not spawn ack task: {}", e);
        }
    }

    /// Look up a registered transport.
    fn transport(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.transports
            .lock()
            .expect("poisoned transports lock")
            .get(&kind)
            .cloned()
    }

    /// The current route order for a destination, per policy and health.
    fn ordered_routes(&self, to: &DeviceId) -> Vec<TransportKind> {
        let cfg = self.netcfg.current();
        let hints = self.peers.get(to);
        let ctx = RouteContext {
            mode: cfg.mode(),
            direct_open: self.transport_phase(TransportKind::Direct) == TransportPhase::Connected,
            self_onion_ready: cfg.self_onion_enabled()
                && self.transport_phase(TransportKind::SelfOnion) == TransportPhase::Connected,
            onion_available: self.transport(TransportKind::OnionRouter).is_some()
                && cfg.onion_proxy_enabled(),
            peer_has_onion_addr: hints.map(|h| h.any_onion()).unwrap_or(false),
        };
        self.route_ctrl
            .decide(&ctx)
            .map(|d| d.ordered())
            .unwrap_or_default()
    }

    /// A transport's current phase, `Idle` when unregistered.
    fn transport_phase(&self, kind: TransportKind) -> TransportPhase {
        self.transport(kind)
            .map(|t| t.state().phase)
            .unwrap_or(TransportPhase::Idle)
    }
}

/// The outbox scheduler's driver, backed by the router.
pub struct RouteDriver<R: Runtime> {
    /// The router that owns the transports.
    router: Arc<Router<R>>,
}

#[async_trait]
impl<R: Runtime> SendDriver for RouteDriver<R> {
    type Route = TransportKind;

    fn routes_for(&self, record: &OutboxRecord) -> Vec<TransportKind> {
        self.router.ordered_routes(&record.to_device)
    }

    async fn send_via(
        &self,
        route: &TransportKind,
        record: &OutboxRecord,
    ) -> Result<(), SendAttemptError> {
        let Some(transport) = self.router.transport(*route) else {
            return Err(SendAttemptError::terminal("NO_SUCH_TRANSPORT"));
        };
        let packet = Packet::new(
            record.message_id.clone(),
            record.to_device.clone(),
            record.ciphertext.clone(),
        );
        transport.send(&packet).await.map_err(|e| {
            use tor_error::HasRetryTime;
            SendAttemptError::with_retry(e.code(), e.retry_time())
        })
    }

    fn note_outcome(&self, route: &TransportKind, ok: bool) {
        if ok {
            self.router.route_ctrl.report_send_success(*route);
        } else {
            self.router.route_ctrl.report_send_fail(*route);
        }
    }
}

/// Wall-clock ms since the epoch, per the runtime.
fn now_ms<R: Runtime>(runtime: &R) -> u64 {
    runtime
        .wallclock()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
