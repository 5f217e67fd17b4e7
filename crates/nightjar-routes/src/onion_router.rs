//! The onion-router transport: send through the local controller, poll
//! its inbox for ingress.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::task::SpawnExt;
use futures::{select_biased, FutureExt, SinkExt};
use oneshot_fused_workaround as oneshot;
use rand::Rng;
use serde_json::{json, Value};
use tor_rtcompat::{Runtime, SleepProvider};
use tracing::{debug, warn};

use nightjar_envelope::{DeviceId, MessageId};
use nightjar_netcfg::NetworkKind;
use nightjar_socks::{HttpClient, Request};

use crate::err::TransportError;
use crate::peers::PeerDirectory;
use crate::transport::{
    InboundEvent, Packet, StateCell, StateEvents, Transport, TransportKind, TransportPhase,
    TransportState,
};

/// Poller backoff floor.
const POLL_BASE: Duration = Duration::from_secs(2);
/// Poller backoff ceiling.
const POLL_CAP: Duration = Duration::from_secs(30);
/// Per-request deadline against the local controller.
const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(10);
/// How many recently seen inbox item ids to remember.
const DEDUP_WINDOW: usize = 4096;
/// Capacity of the inbound event buffer.
const INBOUND_BUFFER: usize = 64;

/// Configuration for the onion-router transport.
#[derive(Debug, Clone)]
pub struct OnionRouterConfig {
    /// Where the local controller listens.
    pub controller_addr: SocketAddr,
    /// This device's id (the inbox we poll).
    pub own_device: DeviceId,
    /// Which network to prefer when both are hinted.
    pub preferred_network: NetworkKind,
}

/// The `onionRouter` transport.
pub struct OnionRouterTransport<R: Runtime> {
    /// Runtime for sleeping and spawning.
    runtime: R,
    /// HTTP client for the (plain, localhost) controller connection.
    client: HttpClient<R>,
    /// Configuration.
    config: OnionRouterConfig,
    /// Peer routing hints, to fill in route targets.
    peers: Arc<PeerDirectory>,
    /// Observable state, shared with the poller task.
    state: Arc<StateCell>,
    /// Producer side of the inbound stream.
    inbound_tx: mpsc::Sender<InboundEvent>,
    /// Consumer side, handed out once.
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    /// Stops the poller when fired or dropped.
    poller_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl<R: Runtime> OnionRouterTransport<R> {
    /// Construct; the inbox poller starts with [`Transport::start`].
    pub fn new(
        runtime: R,
        client: HttpClient<R>,
        config: OnionRouterConfig,
        peers: Arc<PeerDirectory>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        OnionRouterTransport {
            runtime,
            client,
            config,
            peers,
            state: Arc::new(StateCell::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            poller_stop: Mutex::new(None),
        }
    }

    /// The controller URL for `path`.
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.config.controller_addr, path)
    }

    /// Route hints for a packet, from the peer directory.
    ///
    /// One published address selects that network monotonically; with
    /// both published, the explicit network preference wins, and `auto`
    /// (lokinet first, tor fallback) covers the unset case.
    fn route_for(&self, to: &DeviceId) -> Option<Value> {
        let hints = self.peers.get(to)?;
        if !hints.any_onion() {
            return None;
        }
        let mode = match (&hints.onion_addr, &hints.lokinet_addr) {
            (Some(_), None) => "preferTor",
            (None, Some(_)) => "preferLokinet",
            _ => match self.config.preferred_network {
                NetworkKind::Lokinet => "preferLokinet",
                _ => "auto",
            },
        };
        Some(json!({
            "mode": mode,
            "torOnion": hints.onion_addr,
            "lokinet": hints.lokinet_addr,
        }))
    }

    /// The poller task body.
    async fn poll_loop(
        runtime: R,
        client: HttpClient<R>,
        url_base: String,
        own_device: DeviceId,
        mut inbound_tx: mpsc::Sender<InboundEvent>,
        state: Arc<StateCell>,
        stop_rx: oneshot::Receiver<()>,
    ) {
        let mut stop = stop_rx.fuse();
        let mut cursor: Option<String> = None;
        let mut delay = POLL_BASE;
        let mut seen: HashSet<String> = HashSet::new();
        let mut seen_order: VecDeque<String> = VecDeque::new();

        loop {
            let after = cursor.as_deref().unwrap_or("-1");
            let url = format!(
                "{url_base}/onion/inbox?deviceId={}&after={after}",
                own_device
            );
            let request = Request::get(&url).map(|r| r.timeout(CONTROLLER_TIMEOUT));
            let outcome = match request {
                Ok(request) => client.fetch(request).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) if response.is_success() => {
                    delay = POLL_BASE;
                    state.set(TransportState::phase(TransportPhase::Connected));
                    match serde_json::from_slice::<Value>(&response.body) {
                        Ok(body) => {
                            if let Some(next) = body["nextAfter"].as_str() {
                                cursor = Some(next.to_owned());
                            }
                            let items = body["items"].as_array().cloned().unwrap_or_default();
                            for item in items {
                                let id = item["id"].as_str().unwrap_or_default().to_owned();
                                if id.is_empty() || seen.contains(&id) {
                                    continue;
                                }
                                if seen_order.len() == DEDUP_WINDOW {
                                    if let Some(old) = seen_order.pop_front() {
                                        seen.remove(&old);
                                    }
                                }
                                seen.insert(id.clone());
                                seen_order.push_back(id.clone());

                                let event = event_of(&id, &item);
                                if inbound_tx.send(event).await.is_err() {
                                    debug!("inbound consumer gone; poller exiting");
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!("inbox body unparseable: {}", e),
                    }
                }
                Ok(response) => {
                    debug!("inbox poll got status {}", response.status);
                    delay = bump(delay);
                    state.set(TransportState::with_detail(
                        TransportPhase::Degraded,
                        format!("inbox status {}", response.status),
                    ));
                }
                Err(e) => {
                    debug!("inbox poll failed: {}", e);
                    delay = bump(delay);
                    state.set(TransportState::with_detail(
                        TransportPhase::Degraded,
                        "onion controller unavailable",
                    ));
                }
            }

            // Jittered sleep, interruptible by stop.
            let jittered = jitter(delay);
            select_biased! {
                _ = stop => {
                    debug!("inbox poller stopped");
                    return;
                }
                _ = runtime.sleep(jittered).fuse() => {}
            }
        }
    }
}

/// Interpret one inbox item.
///
/// An envelope of the form `{kind: "ack", ackOf: <id>}` is the ack
/// control shape; everything else is an ordinary message.
fn event_of(id: &str, item: &Value) -> InboundEvent {
    let envelope = item["envelope"].clone();
    if envelope["kind"] == "ack" {
        if let Some(of) = envelope["ackOf"].as_str() {
            return InboundEvent::Ack {
                of: MessageId::from(of),
            };
        }
    }
    InboundEvent::Message {
        id: id.to_owned(),
        from: item["from"].as_str().map(DeviceId::from),
        envelope,
    }
}

/// Double a delay, up to the cap.
fn bump(d: Duration) -> Duration {
    (d * 2).min(POLL_CAP)
}

/// Add up to ±25% jitter.
fn jitter(d: Duration) -> Duration {
    let ms = d.as_millis() as u64;
    let amplitude = ms / 4;
    if amplitude == 0 {
        return d;
    }
    let ms = rand::rng().random_range(ms - amplitude..=ms + amplitude);
    Duration::from_millis(ms)
}

#[async_trait]
impl<R: Runtime> Transport for OnionRouterTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::OnionRouter
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut stop_slot = self.poller_stop.lock().expect("poisoned poller lock");
        if stop_slot.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        *stop_slot = Some(stop_tx);
        drop(stop_slot);

        self.state
            .set(TransportState::phase(TransportPhase::Connecting));
        self.runtime
            .spawn(Self::poll_loop(
                self.runtime.clone(),
                self.client.clone(),
                format!("http://{}", self.config.controller_addr),
                self.config.own_device.clone(),
                self.inbound_tx.clone(),
                Arc::clone(&self.state),
                stop_rx,
            ))
            .map_err(|e| TransportError::UpstreamError {
                detail: format!("could not spawn poller: {e}"),
            })?;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(stop) = self.poller_stop.lock().expect("poisoned poller lock").take() {
            let _ = stop.send(());
        }
        self.state.set(TransportState::phase(TransportPhase::Idle));
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let Some(route) = self.route_for(&packet.to) else {
            return Err(TransportError::ForwardFailed {
                inner: "no_route".to_owned(),
            });
        };

        let envelope: Value = serde_json::from_str(&packet.payload)
            .unwrap_or_else(|_| Value::String(packet.payload.clone()));
        // The packet id rides along so the remote side can ack the
        // sender's outbox record by name.
        let body = json!({
            "toDeviceId": packet.to,
            "id": packet.id,
            "envelope": envelope,
            "route": route,
        });
        let request = Request::post(
            &self.url("/onion/send"),
            serde_json::to_vec(&body).unwrap_or_default(),
        )
        .map_err(|e| TransportError::from_fetch(&e))?
        .header("Content-Type", "application/json")
        .timeout(CONTROLLER_TIMEOUT);

        let response = self.client.fetch(request).await.map_err(|e| {
            // The controller itself was unreachable.
            debug!("controller unreachable: {}", e);
            TransportError::ForwardFailed {
                inner: "controller_unavailable".to_owned(),
            }
        })?;

        if response.is_success() {
            return Ok(());
        }
        // Map the controller's error string into the transport taxonomy.
        let body: Value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
        let error = body["error"].as_str().unwrap_or("");
        Err(match error {
            e if e.starts_with("forward_failed:") => {
                let inner = e.trim_start_matches("forward_failed:").to_owned();
                if inner == "no_proxy" {
                    TransportError::ProxyUnreachable
                } else {
                    TransportError::ForwardFailed { inner }
                }
            }
            "" => TransportError::UpstreamError {
                detail: format!("controller status {}", response.status),
            },
            other => TransportError::UpstreamError {
                detail: other.to_owned(),
            },
        })
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
