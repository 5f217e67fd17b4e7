//! Transport-layer error taxonomy.

use tor_error::{HasRetryTime, RetryTime};

use nightjar_socks::FetchError;

/// An error from a transport send (or from the machinery under it).
///
/// `code()` yields the stable string the scheduler and the presentation
/// layer branch on.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The per-send deadline elapsed.
    #[error("send timed out")]
    AbortedTimeout,

    /// A caller-supplied cancellation fired.
    #[error("send cancelled by caller")]
    AbortedParent,

    /// The self-onion path is not `ready`.
    #[error("hop route is not ready")]
    RouteNotReady,

    /// The direct peer channel is not open.
    #[error("direct p2p data channel is not open")]
    ChannelNotOpen,

    /// The controller (or the remote side) refused the forward.
    #[error("forward failed: {inner}")]
    ForwardFailed {
        /// The inner reason, as composed by the controller.
        inner: String,
    },

    /// The SOCKS proxy could not be reached.
    #[error("proxy unreachable")]
    ProxyUnreachable,

    /// The SOCKS exchange failed.
    #[error("proxy handshake failed")]
    HandshakeFailed,

    /// Anything else past the proxy.
    #[error("upstream error: {detail}")]
    UpstreamError {
        /// Human-readable detail.
        detail: String,
    },
}

impl TransportError {
    /// The stable wire code for this error.
    pub fn code(&self) -> String {
        match self {
            TransportError::AbortedTimeout => "ABORTED_TIMEOUT".to_owned(),
            TransportError::AbortedParent => "ABORTED_PARENT".to_owned(),
            TransportError::RouteNotReady => "ROUTE_NOT_READY".to_owned(),
            TransportError::ChannelNotOpen => "CHANNEL_NOT_OPEN".to_owned(),
            TransportError::ForwardFailed { inner } => format!("FORWARD_FAILED:{inner}"),
            TransportError::ProxyUnreachable => "PROXY_UNREACHABLE".to_owned(),
            TransportError::HandshakeFailed => "HANDSHAKE_FAILED".to_owned(),
            TransportError::UpstreamError { .. } => "UPSTREAM_ERROR".to_owned(),
        }
    }

    /// Map a fetch failure (to or through a proxy) into the transport
    /// taxonomy.
    pub fn from_fetch(e: &FetchError) -> Self {
        match e {
            FetchError::Timeout => TransportError::AbortedTimeout,
            FetchError::ProxyUnreachable { .. } => TransportError::ProxyUnreachable,
            FetchError::HandshakeFailed { .. } | FetchError::InvalidProxy(_) => {
                TransportError::HandshakeFailed
            }
            other => TransportError::UpstreamError {
                detail: other.to_string(),
            },
        }
    }
}

impl HasRetryTime for TransportError {
    fn retry_time(&self) -> RetryTime {
        use RetryTime as RT;
        use TransportError as E;
        match self {
            // The deadline already waited for us.
            E::AbortedTimeout => RT::Immediate,
            E::AbortedParent => RT::Never,
            // Both clear up on their own (reconnection, rebuild).
            E::RouteNotReady | E::ChannelNotOpen => RT::AfterWaiting,
            E::ForwardFailed { .. } => RT::AfterWaiting,
            E::ProxyUnreachable | E::UpstreamError { .. } => RT::AfterWaiting,
            // A bad proxy configuration does not heal by retrying here.
            E::HandshakeFailed => RT::Never,
        }
    }
}
