//! Peer routing hints.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use nightjar_envelope::DeviceId;

/// What we know about how to reach one peer device.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerHints {
    /// The peer controller's `.onion` host, if published.
    #[serde(default, rename = "onionAddr", skip_serializing_if = "Option::is_none")]
    pub onion_addr: Option<String>,
    /// The peer controller's `.loki` host, if published.
    #[serde(default, rename = "lokinetAddr", skip_serializing_if = "Option::is_none")]
    pub lokinet_addr: Option<String>,
    /// The peer's pinned identity key, from the friend profile.
    #[serde(default, rename = "identityKey", skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<Vec<u8>>,
}

impl PeerHints {
    /// True if any onion-side address is known.
    pub fn any_onion(&self) -> bool {
        self.onion_addr.is_some() || self.lokinet_addr.is_some()
    }
}

/// Live routing hints for all known peers.
///
/// The identity layer feeds this as friend codes resolve; the router
/// and friend-control scheduler read it.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    /// Hints per device.
    hints: Mutex<HashMap<DeviceId, PeerHints>>,
}

impl PeerDirectory {
    /// Construct an empty directory.
    pub fn new() -> Self {
        PeerDirectory::default()
    }

    /// Record (or replace) hints for `device`.
    pub fn set(&self, device: DeviceId, hints: PeerHints) {
        self.hints
            .lock()
            .expect("poisoned peer directory lock")
            .insert(device, hints);
    }

    /// Hints for `device`, if we have any.
    pub fn get(&self, device: &DeviceId) -> Option<PeerHints> {
        self.hints
            .lock()
            .expect("poisoned peer directory lock")
            .get(device)
            .cloned()
    }

    /// True if `device` is known at all.
    pub fn contains(&self, device: &DeviceId) -> bool {
        self.hints
            .lock()
            .expect("poisoned peer directory lock")
            .contains_key(device)
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
    fn set_get() {
        let dir = PeerDirectory::new();
        let d = DeviceId::from("d1");
        assert!(dir.get(&d).is_none());
        dir.set(
            d.clone(),
            PeerHints {
                onion_addr: Some("x.onion".into()),
                ..Default::default()
            },
        );
        let hints = dir.get(&d).unwrap();
        assert!(hints.any_onion());
        assert_eq!(hints.onion_addr.as_deref(), Some("x.onion"));
    }

    #[test]
    fn wire_names() {
        let hints = PeerHints {
            onion_addr: Some("x.onion".into()),
            lokinet_addr: None,
            identity_key: Some(vec![1, 2]),
        };
        let json = serde_json::to_value(&hints).unwrap();
        assert_eq!(json["onionAddr"], "x.onion");
        assert!(json.get("lokinetAddr").is_none());
    }
}
