//! Transport selection policy and health feedback.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use nightjar_netcfg::RouteMode;

use crate::transport::TransportKind;

/// How long a failed transport sits out of the primary slot.
const COOLDOWN: Duration = Duration::from_secs(15);

/// Everything `decide` looks at for one send.
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    /// The user's transport policy.
    pub mode: RouteMode,
    /// Is the direct channel to this peer open?
    pub direct_open: bool,
    /// Is the self-onion route `ready` (and enabled)?
    pub self_onion_ready: bool,
    /// Is an onion proxy available for the controller path?
    pub onion_available: bool,
    /// Does the peer publish any onion-side address?
    pub peer_has_onion_addr: bool,
}

/// The ordered outcome: one primary plus fallbacks.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct RouteDecision {
    /// Best transport to try first.
    pub primary: TransportKind,
    /// Escalation order after a terminal failure on the primary.
    pub fallbacks: Vec<TransportKind>,
}

impl RouteDecision {
    /// Primary followed by fallbacks, as one list.
    pub fn ordered(&self) -> Vec<TransportKind> {
        let mut v = vec![self.primary];
        v.extend(self.fallbacks.iter().copied());
        v
    }
}

/// Chooses transports and tracks their recent health.
///
/// State flows one way: transports (via the scheduler) report outcomes
/// in; decisions flow out.  Nothing here holds a transport reference.
#[derive(Debug, Default)]
pub struct RouteController {
    /// When each transport last failed.
    last_failure: Mutex<HashMap<TransportKind, Instant>>,
}

impl RouteController {
    /// Construct with no health history.
    pub fn new() -> Self {
        RouteController::default()
    }

    /// Record a failed send on `kind`.
    pub fn report_send_fail(&self, kind: TransportKind) {
        self.report_send_fail_at(kind, Instant::now());
    }

    /// As [`report_send_fail`](Self::report_send_fail), with an explicit clock.
    pub fn report_send_fail_at(&self, kind: TransportKind, now: Instant) {
        debug!("transport {} reported failing", kind);
        self.last_failure
            .lock()
            .expect("poisoned health lock")
            .insert(kind, now);
    }

    /// Record a successful send on `kind`, clearing its cool-down.
    pub fn report_send_success(&self, kind: TransportKind) {
        self.last_failure
            .lock()
            .expect("poisoned health lock")
            .remove(&kind);
    }

    /// True if `kind` failed within the cool-down window.
    fn is_degraded(&self, kind: TransportKind, now: Instant) -> bool {
        self.last_failure
            .lock()
            .expect("poisoned health lock")
            .get(&kind)
            .map(|at| now.saturating_duration_since(*at) < COOLDOWN)
            .unwrap_or(false)
    }

    /// Decide the transport order for one send.
    pub fn decide(&self, ctx: &RouteContext) -> Option<RouteDecision> {
        self.decide_at(ctx, Instant::now())
    }

    /// As [`decide`](Self::decide), with an explicit clock.
    ///
    /// Ordering rules:
    ///  * global `onionRouter` mode forces the controller path, with no
    ///    fallback to less-anonymous transports;
    ///  * otherwise the open direct channel wins, then a ready
    ///    self-onion route, then the controller path;
    ///  * a transport that failed within the cool-down window is pushed
    ///    out of the primary slot but stays available as a fallback.
    pub fn decide_at(&self, ctx: &RouteContext, now: Instant) -> Option<RouteDecision> {
        let onion_usable = ctx.onion_available && ctx.peer_has_onion_addr;
        if ctx.mode == RouteMode::OnionRouter {
            return onion_usable.then(|| RouteDecision {
                primary: TransportKind::OnionRouter,
                fallbacks: Vec::new(),
            });
        }

        let mut available: Vec<TransportKind> = Vec::new();
        match ctx.mode {
            RouteMode::DirectP2p => {
                if ctx.direct_open {
                    available.push(TransportKind::Direct);
                }
            }
            RouteMode::SelfOnion => {
                if ctx.self_onion_ready {
                    available.push(TransportKind::SelfOnion);
                }
                if onion_usable {
                    available.push(TransportKind::OnionRouter);
                }
            }
            _ => {
                if ctx.direct_open {
                    available.push(TransportKind::Direct);
                }
                if ctx.self_onion_ready {
                    available.push(TransportKind::SelfOnion);
                }
                if onion_usable {
                    available.push(TransportKind::OnionRouter);
                }
            }
        }
        if available.is_empty() {
            return None;
        }

        // Healthy transports keep their rank; degraded ones sink.
        let (healthy, degraded): (Vec<_>, Vec<_>) = available
            .into_iter()
            .partition(|kind| !self.is_degraded(*kind, now));
        let mut ordered = healthy;
        ordered.extend(degraded);

        let primary = ordered[0];
        let fallbacks = ordered[1..].to_vec();
        Some(RouteDecision { primary, fallbacks })
    }
}
