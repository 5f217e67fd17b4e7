//! Supervisor status reporting.

use std::sync::Mutex;

use futures::{Stream, StreamExt};
use nightjar_socks::ProxyUrl;
use postage::watch;
use serde::Serialize;

/// The observable state of one supervised daemon.
#[derive(Debug, Clone, Default, PartialEq)]
#[non_exhaustive]
pub enum SupervisorStatus {
    /// No binary is installed for this network.
    #[default]
    Unavailable,
    /// Installed but not running.
    Stopped,
    /// Spawned; waiting for the SOCKS port to come up.
    Starting,
    /// Up and serving.
    Running {
        /// The local SOCKS proxy to route through.
        socks_proxy_url: ProxyUrl,
        /// Our published hidden-service address, if one is configured.
        hidden_service_addr: Option<String>,
        /// Free-form detail (e.g. which binary is running).
        detail: Option<String>,
    },
    /// Startup or runtime failure.
    Failed {
        /// What went wrong, including a tail of daemon output.
        detail: String,
    },
}

impl SupervisorStatus {
    /// True when the daemon is serving.
    pub fn is_running(&self) -> bool {
        matches!(self, SupervisorStatus::Running { .. })
    }

    /// The SOCKS proxy URL, when running.
    pub fn socks_proxy_url(&self) -> Option<&ProxyUrl> {
        match self {
            SupervisorStatus::Running {
                socks_proxy_url, ..
            } => Some(socks_proxy_url),
            _ => None,
        }
    }

    /// The published hidden-service address, when running with one.
    pub fn hidden_service_addr(&self) -> Option<&str> {
        match self {
            SupervisorStatus::Running {
                hidden_service_addr,
                ..
            } => hidden_service_addr.as_deref(),
            _ => None,
        }
    }
}

/// Install/run phase of a component, as reported to the controller's
/// health endpoint.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ComponentStatus {
    /// Nothing is happening.
    Idle,
    /// An artifact download is in progress.
    Downloading,
    /// Verification/extraction is in progress.
    Installing,
    /// The daemon is running.
    Ready,
    /// The last operation failed.
    Failed,
}

/// Snapshot of one network's component, combining install state and
/// runtime state.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct ComponentState {
    /// Is a binary installed (pointer file present)?
    pub installed: bool,
    /// Active version, when installed.
    pub version: Option<String>,
    /// Current phase.
    pub status: ComponentStatus,
    /// Failure detail, when `status` is `failed`.
    pub error: Option<String>,
    /// Install progress (0..=100), when installing.
    pub progress: Option<u8>,
    /// Path of the active binary.
    pub binary_path: Option<std::path::PathBuf>,
    /// The local SOCKS port, when running.
    pub socks_port: Option<u16>,
}

/// Shared status channel: latest value replayed to each new subscriber.
#[derive(Debug)]
pub(crate) struct StatusChannel {
    /// Broadcast side.
    tx: Mutex<watch::Sender<SupervisorStatus>>,
    /// Template receiver for subscribers.
    rx: watch::Receiver<SupervisorStatus>,
}

impl StatusChannel {
    /// Construct a channel starting in `Unavailable`.
    pub(crate) fn new() -> Self {
        let (tx, rx) = watch::channel();
        StatusChannel {
            tx: Mutex::new(tx),
            rx,
        }
    }

    /// Publish a new status.
    pub(crate) fn publish(&self, status: SupervisorStatus) {
        *self
            .tx
            .lock()
            .expect("poisoned status sender lock")
            .borrow_mut() = status;
    }

    /// The most recent status.
    pub(crate) fn latest(&self) -> SupervisorStatus {
        self.rx.borrow().clone()
    }

    /// Subscribe; the current status is yielded first.
    pub(crate) fn events(&self) -> StatusEvents {
        StatusEvents {
            inner: self.rx.clone(),
        }
    }
}

/// A stream of [`SupervisorStatus`] values.
///
/// Lossy under backpressure: a slow reader sees the latest status, not
/// every intermediate one.
#[derive(Clone)]
pub struct StatusEvents {
    /// The receiver implementing this stream.
    inner: watch::Receiver<SupervisorStatus>,
}

impl Stream for StatusEvents {
    type Item = SupervisorStatus;
    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
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
    fn replay_latest_on_subscribe() {
        let ch = StatusChannel::new();
        ch.publish(SupervisorStatus::Starting);
        ch.publish(SupervisorStatus::Failed {
            detail: "boom".into(),
        });

        let mut events = ch.events();
        let first = futures::executor::block_on(events.next()).unwrap();
        assert_eq!(
            first,
            SupervisorStatus::Failed {
                detail: "boom".into()
            }
        );
        assert_eq!(ch.latest(), first);
    }

    #[test]
    fn accessors() {
        let url: ProxyUrl = "socks5h://127.0.0.1:9050".parse().unwrap();
        let s = SupervisorStatus::Running {
            socks_proxy_url: url.clone(),
            hidden_service_addr: Some("abc.onion".into()),
            detail: None,
        };
        assert!(s.is_running());
        assert_eq!(s.socks_proxy_url(), Some(&url));
        assert_eq!(s.hidden_service_addr(), Some("abc.onion"));
        assert!(!SupervisorStatus::Stopped.is_running());
    }
}
