//! Persistence and change notification for [`NetConfig`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use fs_mistrust::{CheckedDir, Mistrust};
use futures::{Stream, StreamExt};
use postage::watch;
use tracing::{debug, info};

use nightjar_socks::{EgressGate, RequestClass};

use crate::config::NetConfig;

/// File name for the persisted policy, relative to the state directory.
const CONFIG_FILE: &str = "netconfig.json";

/// An error from loading or storing the network configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Could not access the state directory or file.
    #[error("filesystem problem with the netconfig store")]
    Fs(#[from] fs_mistrust::Error),

    /// The persisted file was not valid configuration JSON.
    #[error("corrupt netconfig file")]
    Corrupt(#[from] serde_json::Error),

    /// The persisted file held values that no longer validate.
    #[error("persisted netconfig no longer validates")]
    Invalid(#[from] tor_config::ConfigBuildError),
}

/// Owner of the persisted [`NetConfig`] and its change notifications.
///
/// The configuration is read-mostly: `current()` is cheap, and mutations
/// go through [`NetConfigStore::replace`], which persists first and then
/// broadcasts.  The force rules for `onionRouter` mode are applied before
/// persisting, so the file on disk is already the effective policy.
pub struct NetConfigStore {
    /// Directory holding the config file.
    dir: CheckedDir,
    /// Latest value, for synchronous readers.
    current: Arc<Mutex<NetConfig>>,
    /// Broadcast side of the change channel.
    tx: Mutex<watch::Sender<NetConfig>>,
    /// Template receiver cloned out to subscribers.
    rx: watch::Receiver<NetConfig>,
}

impl NetConfigStore {
    /// Open (or initialize) the store under `state_dir`.
    pub fn open(state_dir: &Path, mistrust: &Mistrust) -> Result<Self, StoreError> {
        let dir = mistrust.verifier().make_secure_dir(state_dir)?;

        let cfg = match dir.read_to_string(CONFIG_FILE) {
            Ok(text) => {
                let builder: crate::NetConfigBuilder = serde_json::from_str(&text)?;
                builder.build()?.effective()
            }
            Err(fs_mistrust::Error::NotFound(_)) => {
                info!("no persisted netconfig; starting from defaults");
                NetConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        let (mut tx, rx) = watch::channel::<NetConfig>();
        *tx.borrow_mut() = cfg.clone();
        Ok(NetConfigStore {
            dir,
            current: Arc::new(Mutex::new(cfg)),
            tx: Mutex::new(tx),
            rx,
        })
    }

    /// The current configuration.
    pub fn current(&self) -> NetConfig {
        self.current.lock().expect("poisoned netconfig lock").clone()
    }

    /// Replace the configuration: apply force rules, persist, broadcast.
    pub fn replace(&self, cfg: NetConfig) -> Result<(), StoreError> {
        let cfg = cfg.effective();
        let json = serde_json::to_string_pretty(&builder_of(&cfg))?;
        self.dir.write_and_replace(CONFIG_FILE, json)?;
        debug!("netconfig replaced; mode={:?}", cfg.mode());

        *self.current.lock().expect("poisoned netconfig lock") = cfg.clone();
        *self
            .tx
            .lock()
            .expect("poisoned netconfig sender lock")
            .borrow_mut() = cfg;
        Ok(())
    }

    /// Subscribe to configuration changes.
    ///
    /// The stream yields the current value immediately, then every
    /// subsequent replacement.
    pub fn events(&self) -> NetConfigEvents {
        NetConfigEvents {
            inner: self.rx.clone(),
        }
    }

    /// An egress gate enforcing this store's link-preview policy.
    pub fn egress_gate(&self) -> NetEgressGate {
        NetEgressGate {
            current: Arc::clone(&self.current),
        }
    }
}

/// Render a config back into its serializable builder form.
fn builder_of(cfg: &NetConfig) -> crate::NetConfigBuilder {
    let mut b = crate::NetConfigBuilder::default();
    b.mode(cfg.mode())
        .onion_proxy_enabled(cfg.onion_proxy_enabled())
        .onion_proxy_url(cfg.onion_proxy_url().cloned())
        .allow_remote_proxy(cfg.allow_remote_proxy())
        .webrtc_relay_only(cfg.webrtc_relay_only())
        .disable_link_preview(cfg.disable_link_preview())
        .self_onion_enabled(cfg.self_onion_enabled())
        .self_onion_min_relays(cfg.self_onion_min_relays())
        .onion_selected_network(cfg.onion_selected_network())
        .tor_bridges_mode(cfg.tor_bridges_mode())
        .tor_country_code(cfg.tor_country_code().map(str::to_owned));
    b
}

/// A stream of configuration values: the latest at subscription time,
/// then one per change.
///
/// Lossy in the usual watch-channel way: a slow reader sees the newest
/// value, not every intermediate one.
#[derive(Clone)]
pub struct NetConfigEvents {
    /// The receiver that implements this stream.
    inner: watch::Receiver<NetConfig>,
}

impl Stream for NetConfigEvents {
    type Item = NetConfig;
    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Egress policy hook derived from the live configuration.
#[derive(Clone)]
pub struct NetEgressGate {
    /// Shared view of the current configuration.
    current: Arc<Mutex<NetConfig>>,
}

impl EgressGate for NetEgressGate {
    fn allow(&self, class: RequestClass) -> bool {
        match class {
            RequestClass::LinkPreview => !self
                .current
                .lock()
                .expect("poisoned netconfig lock")
                .disable_link_preview(),
            // Delivery-plane and installer traffic is governed by routing
            // policy, not blocked outright.
            _ => true,
        }
    }
}
