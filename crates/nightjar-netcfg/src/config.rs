//! The network-privacy configuration and its validation rules.

use derive_builder::Builder;
use nightjar_socks::ProxyUrl;
use serde::{Deserialize, Serialize};
use tor_config::{impl_standard_builder, ConfigBuildError};

/// Smallest allowed self-onion hop count.
pub const SELF_ONION_MIN_RELAYS: u8 = 3;
/// Largest allowed self-onion hop count.
pub const SELF_ONION_MAX_RELAYS: u8 = 5;

/// The user's primary transport policy.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RouteMode {
    /// Pick the best available transport per message.
    #[default]
    #[serde(rename = "auto")]
    Auto,
    /// Prefer the established peer-to-peer channel.
    #[serde(rename = "directP2P")]
    DirectP2p,
    /// Prefer the internally built multi-hop onion path.
    #[serde(rename = "selfOnion")]
    SelfOnion,
    /// Route everything through the Tor/Lokinet onion controller.
    #[serde(rename = "onionRouter")]
    OnionRouter,
}

/// Which external anonymizing network to prefer.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum NetworkKind {
    /// The Tor network.
    #[default]
    Tor,
    /// The Lokinet network.
    Lokinet,
}

impl NetworkKind {
    /// Lowercase name, as used in paths and health reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkKind::Tor => "tor",
            NetworkKind::Lokinet => "lokinet",
        }
    }
}

impl std::fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bridge usage policy for Tor.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum BridgesMode {
    /// Never use bridges.
    Off,
    /// Use bridges when the country policy calls for them.
    #[default]
    Auto,
    /// Always use bridges.
    Force,
}

/// The persisted network-privacy policy.
///
/// This type is immutable once constructed; use [`NetConfigBuilder`] (or
/// deserialize one) to make a value, and
/// [`NetConfigStore`](crate::NetConfigStore) to persist and observe it.
#[derive(Debug, Clone, Eq, PartialEq, Builder)]
#[builder(build_fn(validate = "Self::validate", error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct NetConfig {
    /// Primary transport policy.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) mode: RouteMode,

    /// Whether HTTP egress may use the onion proxy.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) onion_proxy_enabled: bool,

    /// The SOCKS proxy used for onion-routed egress.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) onion_proxy_url: Option<ProxyUrl>,

    /// Allow proxies that are not on localhost.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) allow_remote_proxy: bool,

    /// Restrict WebRTC peer candidates to relay-only.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) webrtc_relay_only: bool,

    /// Refuse outbound HTTP classified as link-preview fetching.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) disable_link_preview: bool,

    /// Whether the self-onion transport may be used.
    #[builder(default = "true")]
    #[builder_field_attr(serde(default))]
    pub(crate) self_onion_enabled: bool,

    /// Desired self-onion hop count (3 to 5).
    #[builder(default = "SELF_ONION_MIN_RELAYS")]
    #[builder_field_attr(serde(default))]
    pub(crate) self_onion_min_relays: u8,

    /// Which anonymizing network the supervisor should run.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) onion_selected_network: NetworkKind,

    /// Bridge usage policy.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) tor_bridges_mode: BridgesMode,

    /// Two-letter country override for bridge policy, if the user set one.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) tor_country_code: Option<String>,
}

impl_standard_builder! { NetConfig }

impl NetConfigBuilder {
    /// Check invariants that involve more than one field.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        if let Some(Some(url)) = &self.onion_proxy_url {
            let allow_remote = self.allow_remote_proxy.unwrap_or(false);
            if !allow_remote && !url.is_localhost() {
                return Err(ConfigBuildError::Invalid {
                    field: "onion_proxy_url".to_owned(),
                    problem: format!("{url} is not local and allow_remote_proxy is false"),
                });
            }
        }
        if let Some(n) = self.self_onion_min_relays {
            if !(SELF_ONION_MIN_RELAYS..=SELF_ONION_MAX_RELAYS).contains(&n) {
                return Err(ConfigBuildError::Invalid {
                    field: "self_onion_min_relays".to_owned(),
                    problem: format!(
                        "{n} is outside {SELF_ONION_MIN_RELAYS}..={SELF_ONION_MAX_RELAYS}"
                    ),
                });
            }
        }
        if let Some(Some(cc)) = &self.tor_country_code {
            if cc.len() != 2 || !cc.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ConfigBuildError::Invalid {
                    field: "tor_country_code".to_owned(),
                    problem: format!("{cc:?} is not a two-letter country code"),
                });
            }
        }
        Ok(())
    }
}

impl NetConfig {
    /// Primary transport policy.
    pub fn mode(&self) -> RouteMode {
        self.mode
    }

    /// Whether onion-proxied egress is enabled (after force rules).
    pub fn onion_proxy_enabled(&self) -> bool {
        self.onion_proxy_enabled || self.mode == RouteMode::OnionRouter
    }

    /// The configured SOCKS proxy, if any.
    pub fn onion_proxy_url(&self) -> Option<&ProxyUrl> {
        self.onion_proxy_url.as_ref()
    }

    /// Whether non-localhost proxies are allowed.
    pub fn allow_remote_proxy(&self) -> bool {
        self.allow_remote_proxy
    }

    /// Whether WebRTC candidates are restricted to relays (after force
    /// rules).
    pub fn webrtc_relay_only(&self) -> bool {
        self.webrtc_relay_only || self.mode == RouteMode::OnionRouter
    }

    /// Whether link-preview egress is blocked (after force rules).
    pub fn disable_link_preview(&self) -> bool {
        self.disable_link_preview || self.mode == RouteMode::OnionRouter
    }

    /// Whether the self-onion transport may be used.
    pub fn self_onion_enabled(&self) -> bool {
        self.self_onion_enabled
    }

    /// Desired self-onion hop count.
    pub fn self_onion_min_relays(&self) -> u8 {
        self.self_onion_min_relays
    }

    /// Which anonymizing network the supervisor should run.
    pub fn onion_selected_network(&self) -> NetworkKind {
        self.onion_selected_network
    }

    /// Bridge usage policy.
    pub fn tor_bridges_mode(&self) -> BridgesMode {
        self.tor_bridges_mode
    }

    /// Country override for bridge policy.
    pub fn tor_country_code(&self) -> Option<&str> {
        self.tor_country_code.as_deref()
    }

    /// Return a copy with the `onionRouter` force rules applied to the
    /// stored fields themselves.
    ///
    /// In `onionRouter` mode there must be no observable way to leak
    /// around the onion route, so the proxy gate, relay-only restriction,
    /// and link-preview block all read as set.
    pub fn effective(&self) -> NetConfig {
        let mut cfg = self.clone();
        if cfg.mode == RouteMode::OnionRouter {
            cfg.onion_proxy_enabled = true;
            cfg.webrtc_relay_only = true;
            cfg.disable_link_preview = true;
        }
        cfg
    }
}
