//! The forwarding path: relay an envelope to a remote controller over
//! the appropriate SOCKS proxy.

use std::time::Duration;

use safelog::sensitive;
use serde_json::json;
use tor_rtcompat::Runtime;
use tracing::{debug, info};

use nightjar_socks::{FetchError, HttpClient, ProxyUrl, Request};

use crate::msgs::{RouteHints, RouteMode, SendBody};

/// Per-candidate forward deadline.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// What one anonymizing network currently offers.
#[derive(Debug, Clone, Default)]
pub struct EndpointInfo {
    /// Is the network's daemon up?
    pub active: bool,
    /// The SOCKS proxy to reach it through, when configured.
    pub proxy: Option<ProxyUrl>,
    /// Our own published address on that network, if any.
    pub address: Option<String>,
    /// Free-form status detail.
    pub details: String,
}

/// Live view of the supervised networks, as the controller needs it.
///
/// The daemon implements this over its Tor and Lokinet managers; tests
/// implement it statically.
pub trait ProxyDirectory: Send + Sync + 'static {
    /// Tor's current endpoint info.
    fn tor(&self) -> EndpointInfo;
    /// Lokinet's current endpoint info.
    fn lokinet(&self) -> EndpointInfo;
    /// Which network the user selected (`"tor"` or `"lokinet"`).
    fn selected(&self) -> String {
        "tor".to_owned()
    }
}

/// Which network a candidate would use.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum CandidateKind {
    /// Route via lokinet.
    Lokinet,
    /// Route via tor.
    Tor,
}

impl CandidateKind {
    /// Wire name, as reported in forward results.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Lokinet => "lokinet",
            CandidateKind::Tor => "tor",
        }
    }
}

/// One concrete forwarding option: a target host plus the proxy to
/// reach it through (when one is configured).
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    /// Which network this is.
    pub(crate) kind: CandidateKind,
    /// The remote controller's host on that network.
    pub(crate) target: String,
    /// The SOCKS proxy for that network.
    pub(crate) proxy: Option<ProxyUrl>,
}

/// How a forwarding attempt concluded.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ForwardOutcome {
    /// Delivered; `route` names the network that worked.
    Forwarded {
        /// `"tor"` or `"lokinet"`.
        route: &'static str,
    },
    /// Failed; the composed code is `forward_failed:<inner>` and
    /// `status` is the HTTP status to answer with.
    Failed {
        /// The composed error code.
        error: String,
        /// HTTP status for the response.
        status: u16,
    },
}

impl ForwardOutcome {
    /// Shorthand for a failure.
    fn failed(inner: &str, status: u16) -> Self {
        ForwardOutcome::Failed {
            error: format!("forward_failed:{inner}"),
            status,
        }
    }
}

/// Build the ordered candidate list for `route`.
///
/// Explicit modes are monotonic: a `preferTor` send never touches
/// lokinet, and vice versa.  Only `auto` produces more than one
/// candidate.
pub(crate) fn candidates(
    route: &RouteHints,
    directory: &dyn ProxyDirectory,
) -> Result<Vec<Candidate>, ForwardOutcome> {
    let Some(mode) = RouteMode::parse(route.mode.as_deref()) else {
        return Err(ForwardOutcome::failed("bad_mode", 400));
    };

    let lokinet = route.lokinet.as_ref().map(|target| Candidate {
        kind: CandidateKind::Lokinet,
        target: target.clone(),
        proxy: directory.lokinet().proxy,
    });
    let tor = route.tor_onion.as_ref().map(|target| Candidate {
        kind: CandidateKind::Tor,
        target: target.clone(),
        proxy: directory.tor().proxy,
    });

    let list: Vec<Candidate> = match mode {
        RouteMode::PreferLokinet => lokinet.into_iter().collect(),
        RouteMode::PreferTor => tor.into_iter().collect(),
        RouteMode::Manual => match (lokinet, tor) {
            (Some(c), None) | (None, Some(c)) => vec![c],
            _ => Vec::new(),
        },
        RouteMode::Auto => lokinet.into_iter().chain(tor).collect(),
    };

    if list.is_empty() {
        return Err(ForwardOutcome::failed("no_route", 400));
    }
    Ok(list)
}

/// Relay `body` to the remote controller named by `route`.
pub(crate) async fn forward<R: Runtime>(
    client: &HttpClient<R>,
    directory: &dyn ProxyDirectory,
    body: &SendBody,
    route: &RouteHints,
    msg_id: &str,
    now_ms: u64,
) -> ForwardOutcome {
    let list = match candidates(route, directory) {
        Ok(list) => list,
        Err(outcome) => return outcome,
    };
    let auto = matches!(RouteMode::parse(route.mode.as_deref()), Some(RouteMode::Auto));

    let payload = json!({
        "toDeviceId": body.to_device_id,
        "from": body.from_device_id,
        "envelope": body.envelope,
        "ts": now_ms,
        "id": msg_id,
    });
    let payload = serde_json::to_vec(&payload).expect("payload serialization cannot fail");

    let mut last_inner = "no_route".to_owned();
    for (i, candidate) in list.iter().enumerate() {
        let Some(proxy) = candidate.proxy.clone() else {
            debug!(
                "no proxy configured for {} candidate",
                candidate.kind.as_str()
            );
            if auto && i + 1 < list.len() {
                last_inner = "no_proxy".to_owned();
                continue;
            }
            return ForwardOutcome::failed("no_proxy", 502);
        };

        let url = format!("http://{}/onion/ingest", candidate.target);
        debug!(
            "forwarding {} via {} to {}",
            msg_id,
            candidate.kind.as_str(),
            sensitive(&candidate.target)
        );
        let request = match Request::post(&url, payload.clone()) {
            Ok(r) => r
                .header("Content-Type", "application/json")
                .timeout(FORWARD_TIMEOUT)
                .via(proxy),
            Err(e) => {
                last_inner = e.code().to_owned();
                if auto && i + 1 < list.len() {
                    continue;
                }
                return ForwardOutcome::failed(&last_inner, 502);
            }
        };

        match client.fetch(request).await {
            Ok(response) if response.is_success() => {
                info!(
                    "forwarded {} via {}",
                    msg_id,
                    candidate.kind.as_str()
                );
                return ForwardOutcome::Forwarded {
                    route: candidate.kind.as_str(),
                };
            }
            Ok(response) => {
                last_inner = format!("status_{}", response.status);
            }
            Err(e) => {
                last_inner = classify(&e);
            }
        }
        debug!(
            "forward candidate {} failed: {}",
            candidate.kind.as_str(),
            last_inner
        );
        if !(auto && i + 1 < list.len()) {
            return ForwardOutcome::failed(&last_inner, 502);
        }
    }
    ForwardOutcome::failed(&last_inner, 502)
}

/// Map a fetch error to the inner code of `forward_failed:<inner>`.
///
/// The proxy's identity never appears here; only the failure class
/// does.
fn classify(e: &FetchError) -> String {
    e.code().to_owned()
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

    /// A directory with fixed proxies.
    struct Fixed {
        /// Tor proxy, if any.
        tor: Option<ProxyUrl>,
        /// Lokinet proxy, if any.
        lokinet: Option<ProxyUrl>,
    }

    impl ProxyDirectory for Fixed {
        fn tor(&self) -> EndpointInfo {
            EndpointInfo {
                active: self.tor.is_some(),
                proxy: self.tor.clone(),
                address: None,
                details: String::new(),
            }
        }
        fn lokinet(&self) -> EndpointInfo {
            EndpointInfo {
                active: self.lokinet.is_some(),
                proxy: self.lokinet.clone(),
                address: None,
                details: String::new(),
            }
        }
    }

    fn both() -> Fixed {
        Fixed {
            tor: Some("socks5h://127.0.0.1:9250".parse().unwrap()),
            lokinet: Some("socks5h://127.0.0.1:9260".parse().unwrap()),
        }
    }

    fn hints(mode: Option<&str>, tor: Option<&str>, lokinet: Option<&str>) -> RouteHints {
        RouteHints {
            mode: mode.map(str::to_owned),
            tor_onion: tor.map(str::to_owned),
            lokinet: lokinet.map(str::to_owned),
        }
    }

    #[test]
    fn auto_orders_lokinet_first() {
        let list = candidates(
            &hints(Some("auto"), Some("x.onion"), Some("l.lok")),
            &both(),
        )
        .unwrap();
        let kinds: Vec<_> = list.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CandidateKind::Lokinet, CandidateKind::Tor]);
    }

    #[test]
    fn prefer_modes_are_monotonic() {
        let list = candidates(
            &hints(Some("preferTor"), Some("x.onion"), Some("l.lok")),
            &both(),
        )
        .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, CandidateKind::Tor);

        let list = candidates(
            &hints(Some("preferLokinet"), Some("x.onion"), Some("l.lok")),
            &both(),
        )
        .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, CandidateKind::Lokinet);
    }

    #[test]
    fn manual_requires_exactly_one_target() {
        assert!(candidates(&hints(Some("manual"), Some("x.onion"), None), &both()).is_ok());
        let err = candidates(
            &hints(Some("manual"), Some("x.onion"), Some("l.lok")),
            &both(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ForwardOutcome::Failed { ref error, status: 400 } if error == "forward_failed:no_route"
        ));
    }

    #[test]
    fn empty_hints_are_no_route() {
        let err = candidates(&hints(Some("auto"), None, None), &both()).unwrap_err();
        assert!(matches!(
            err,
            ForwardOutcome::Failed { ref error, status: 400 } if error == "forward_failed:no_route"
        ));
    }

    #[test]
    fn unknown_mode_is_an_error() {
        let err = candidates(&hints(Some("teleport"), Some("x.onion"), None), &both()).unwrap_err();
        assert!(matches!(err, ForwardOutcome::Failed { status: 400, .. }));
    }
}
