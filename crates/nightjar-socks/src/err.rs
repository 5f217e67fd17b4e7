//! Error taxonomy for proxied HTTP fetches.

use std::sync::Arc;

use tor_error::{HasRetryTime, RetryTime};

use crate::proxy::ProxyUrlError;
use crate::RequestClass;

/// An error from a single [`HttpClient::fetch`](crate::HttpClient::fetch)
/// call, classified the way the route controller wants to see it.
///
/// The classification collapses detail: callers branch on
/// the four wire codes (plus the local-policy ones), not on the precise
/// I/O failure underneath.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The overall deadline for the call expired.
    #[error("request timed out")]
    Timeout,

    /// We could not reach the proxy (or, for direct requests, the host):
    /// connection refused, reset, or name resolution failure.
    #[error("proxy unreachable during {action}")]
    ProxyUnreachable {
        /// What we were doing when the connection failed.
        action: &'static str,
        /// The underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The SOCKS exchange itself failed: the proxy refused our auth
    /// method, rejected the credentials, or returned a negative reply.
    #[error("SOCKS handshake failed: {detail}")]
    HandshakeFailed {
        /// Human-readable description of the refusal.
        detail: String,
    },

    /// The proxy URL could not be parsed or was not usable.
    ///
    /// This is never retried: the URL will not get better on its own.
    #[error("invalid proxy URL")]
    InvalidProxy(#[from] ProxyUrlError),

    /// Anything that went wrong past the proxy: TLS negotiation, a
    /// garbled HTTP response, an oversized body.
    #[error("upstream error: {detail}")]
    UpstreamError {
        /// Human-readable description.
        detail: String,
    },

    /// Local privacy policy refused to let this request leave.
    #[error("egress blocked for {class:?} requests")]
    EgressBlocked {
        /// The class of the rejected request.
        class: RequestClass,
    },
}

impl FetchError {
    /// Return the wire code for this error, as surfaced to callers and
    /// composed into `forward_failed:<inner>` strings.
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Timeout => "timeout",
            FetchError::ProxyUnreachable { .. } => "proxy_unreachable",
            FetchError::HandshakeFailed { .. } | FetchError::InvalidProxy(_) => "handshake_failed",
            FetchError::UpstreamError { .. } => "upstream_error",
            FetchError::EgressBlocked { .. } => "egress_blocked",
        }
    }

    /// Helper: wrap an I/O error observed while doing `action`.
    pub(crate) fn unreachable(action: &'static str, e: std::io::Error) -> Self {
        FetchError::ProxyUnreachable {
            action,
            source: Arc::new(e),
        }
    }

    /// Helper: an upstream error with a formatted detail string.
    pub(crate) fn upstream(detail: impl Into<String>) -> Self {
        FetchError::UpstreamError {
            detail: detail.into(),
        }
    }

    /// Helper: a handshake failure with a formatted detail string.
    pub(crate) fn handshake(detail: impl Into<String>) -> Self {
        FetchError::HandshakeFailed {
            detail: detail.into(),
        }
    }
}

impl HasRetryTime for FetchError {
    fn retry_time(&self) -> RetryTime {
        use FetchError as E;
        use RetryTime as RT;
        match self {
            // The deadline already enforced a wait.
            E::Timeout => RT::Immediate,
            E::ProxyUnreachable { .. } => RT::AfterWaiting,
            E::HandshakeFailed { .. } => RT::AfterWaiting,
            E::UpstreamError { .. } => RT::AfterWaiting,
            // A malformed URL or a policy block won't fix itself.
            E::InvalidProxy(_) => RT::Never,
            E::EgressBlocked { .. } => RT::Never,
        }
    }
}
