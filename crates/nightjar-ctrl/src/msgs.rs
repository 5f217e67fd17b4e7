//! Wire types for the controller's JSON endpoints.

use serde::Deserialize;
use serde_json::Value;

/// Route selection for a forwarded send.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum RouteMode {
    /// Try lokinet, then tor, in that order.
    Auto,
    /// Lokinet only; never fall back across networks.
    PreferLokinet,
    /// Tor only; never fall back across networks.
    PreferTor,
    /// Exactly one target must be supplied; use it.
    Manual,
}

impl RouteMode {
    /// Parse the wire form; absent means auto.
    pub(crate) fn parse(s: Option<&str>) -> Option<RouteMode> {
        match s {
            None | Some("auto") => Some(RouteMode::Auto),
            Some("preferLokinet") => Some(RouteMode::PreferLokinet),
            Some("preferTor") => Some(RouteMode::PreferTor),
            Some("manual") => Some(RouteMode::Manual),
            Some(_) => None,
        }
    }
}

/// The `route` object of a send request.
#[derive(Debug, Clone, Default, Deserialize)]
#[non_exhaustive]
pub struct RouteHints {
    /// Route mode; absent means `auto`.
    #[serde(default)]
    pub mode: Option<String>,
    /// The recipient's `.onion` host.  (`toOnion` is the legacy name.)
    #[serde(default, rename = "torOnion", alias = "toOnion")]
    pub tor_onion: Option<String>,
    /// The recipient's `.loki` host.
    #[serde(default)]
    pub lokinet: Option<String>,
}

impl RouteHints {
    /// True if any hint at all was supplied.
    pub(crate) fn any(&self) -> bool {
        self.mode.is_some() || self.tor_onion.is_some() || self.lokinet.is_some()
    }
}

/// Body of `POST /onion/send` and `POST /onion/ingest`.
///
/// Legacy senders used `to` and `from`; both spellings are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[non_exhaustive]
pub struct SendBody {
    /// Destination device.
    #[serde(default, rename = "toDeviceId", alias = "to")]
    pub to_device_id: Option<String>,
    /// Sending device, if the sender says.
    #[serde(default, rename = "fromDeviceId", alias = "from")]
    pub from_device_id: Option<String>,
    /// The opaque envelope; the controller never looks inside.
    #[serde(default)]
    pub envelope: Option<Value>,
    /// Queue TTL override, ms.
    #[serde(default, rename = "ttlMs")]
    pub ttl_ms: Option<u64>,
    /// Sender-supplied timestamp, ms.
    #[serde(default)]
    pub ts: Option<u64>,
    /// Sender-supplied message id (remote ingests carry one).
    #[serde(default)]
    pub id: Option<String>,
    /// Forwarding hints; presence selects the forwarding path.
    #[serde(default)]
    pub route: Option<RouteHints>,
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
    fn legacy_aliases() {
        let body: SendBody = serde_json::from_str(
            r#"{"to": "dev-1", "from": "dev-2", "envelope": "E",
                "route": {"toOnion": "x.onion"}}"#,
        )
        .unwrap();
        assert_eq!(body.to_device_id.as_deref(), Some("dev-1"));
        assert_eq!(body.from_device_id.as_deref(), Some("dev-2"));
        assert_eq!(body.envelope, Some(Value::String("E".into())));
        assert_eq!(
            body.route.unwrap().tor_onion.as_deref(),
            Some("x.onion")
        );
    }

    #[test]
    fn modern_names() {
        let body: SendBody = serde_json::from_str(
            r#"{"toDeviceId": "d", "envelope": {"v":1}, "ttlMs": 5000,
                "route": {"mode": "preferTor", "torOnion": "y.onion"}}"#,
        )
        .unwrap();
        assert_eq!(body.to_device_id.as_deref(), Some("d"));
        assert_eq!(body.ttl_ms, Some(5000));
        let route = body.route.unwrap();
        assert_eq!(RouteMode::parse(route.mode.as_deref()), Some(RouteMode::PreferTor));
        assert_eq!(route.tor_onion.as_deref(), Some("y.onion"));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(RouteMode::parse(None), Some(RouteMode::Auto));
        assert_eq!(RouteMode::parse(Some("auto")), Some(RouteMode::Auto));
        assert_eq!(
            RouteMode::parse(Some("preferLokinet")),
            Some(RouteMode::PreferLokinet)
        );
        assert_eq!(RouteMode::parse(Some("manual")), Some(RouteMode::Manual));
        assert_eq!(RouteMode::parse(Some("teleport")), None);
    }
}
