//! Retry handling for friend-control frames.
//!
//! Friend requests and responses ride the ordinary outbox at high
//! priority.  The one wrinkle is a friend code that has not resolved to
//! a device id yet: such frames park here as `unreachable` until the
//! identity layer reports routing hints, at which point they re-enter
//! the pipeline.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tor_rtcompat::Runtime;
use tracing::{debug, info};

use nightjar_envelope::{ControlFrame, DeviceId, FrameSigner, MessageId, SignedControl};
use nightjar_outbox::Priority;

use crate::router::{Router, RouterError, SendRequest};

/// Where a friend-control frame should go.
#[derive(Debug, Clone)]
pub struct FriendTarget {
    /// The friend-code identifier (always known).
    pub code_id: String,
    /// The resolved device, once routing hints arrive.
    pub device: Option<DeviceId>,
}

/// Lifecycle of a parked frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum PendingState {
    /// Handed to the outbox.
    Queued,
    /// Waiting for the friend code to resolve to a device.
    Unreachable,
}

/// One frame awaiting (re)submission.
#[derive(Debug, Clone)]
struct PendingFrame {
    /// Destination.
    target: FriendTarget,
    /// The frame to send.
    frame: ControlFrame,
    /// Current state.
    state: PendingState,
}

/// Queues, signs, and retries friend-control frames.
pub struct FriendControl<R: Runtime> {
    /// The router that carries the frames.
    router: Arc<Router<R>>,
    /// Signs frame bodies with our identity key.
    signer: Arc<dyn FrameSigner>,
    /// Our own device id (the frame author).
    own_device: DeviceId,
    /// Frames by friend code.
    pending: Mutex<Vec<PendingFrame>>,
}

impl<R: Runtime> FriendControl<R> {
    /// Construct a friend-control scheduler.
    pub fn new(router: Arc<Router<R>>, signer: Arc<dyn FrameSigner>, own_device: DeviceId) -> Self {
        FriendControl {
            router,
            signer,
            own_device,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a control frame for a friend.
    ///
    /// Returns the resulting state: `Unreachable` frames wait for
    /// [`hints_updated`](Self::hints_updated).
    pub fn queue(&self, target: FriendTarget, frame: ControlFrame) -> PendingState {
        let state = match self.submit(&target, &frame) {
            Ok(()) => PendingState::Queued,
            Err(e) => {
                debug!(
                    "friend frame for code {} deferred: {}",
                    target.code_id,
                    e.code()
                );
                PendingState::Unreachable
            }
        };
        self.pending.lock().expect("poisoned pending lock").push(PendingFrame {
            target,
            frame,
            state,
        });
        state
    }

    /// The identity layer resolved (or refreshed) hints for `device`
    /// under friend code `code_id`: retry everything parked on it.
    pub fn hints_updated(&self, code_id: &str, device: DeviceId) {
        let mut pending = self.pending.lock().expect("poisoned pending lock");
        for entry in pending.iter_mut() {
            if entry.target.code_id != code_id || entry.state != PendingState::Unreachable {
                continue;
            }
            entry.target.device = Some(device.clone());
            match self.submit(&entry.target, &entry.frame) {
                Ok(()) => {
                    info!("deferred friend frame for code {} now queued", code_id);
                    entry.state = PendingState::Queued;
                }
                Err(e) => {
                    debug!("friend frame still unreachable: {}", e.code());
                }
            }
        }
    }

    /// States of all tracked frames for a friend code.
    pub fn states_for(&self, code_id: &str) -> Vec<PendingState> {
        self.pending
            .lock()
            .expect("poisoned pending lock")
            .iter()
            .filter(|p| p.target.code_id == code_id)
            .map(|p| p.state)
            .collect()
    }

    /// Sign and hand one frame to the router.
    fn submit(&self, target: &FriendTarget, frame: &ControlFrame) -> Result<(), RouterError> {
        let device = target
            .device
            .clone()
            .ok_or(RouterError::MissingDestinationTo)?;
        let signed = SignedControl::sign(self.own_device.clone(), frame, self.signer.as_ref());
        let message_id = MessageId::generate(&mut rand::rng());
        let ciphertext = json!({
            "kind": "control",
            "control": signed,
        })
        .to_string();

        self.router.queue_send(SendRequest {
            conv_id: format!("friend:{}", target.code_id).as_str().into(),
            to_device: Some(device),
            ciphertext,
            priority: Priority::High,
            message_id,
            ttl_ms: None,
        })?;
        Ok(())
    }
}
