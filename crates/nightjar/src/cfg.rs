//! The daemon's TOML configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use nightjar_netcfg::{NetConfig, NetConfigBuilder};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct NightjarConfig {
    /// Where all persistent state lives.
    #[serde(default)]
    pub(crate) state_dir: Option<PathBuf>,
    /// This device's opaque id, as assigned by the identity layer.
    #[serde(default)]
    pub(crate) device_id: Option<String>,
    /// Logging options.
    #[serde(default)]
    pub(crate) logging: LoggingSection,
    /// Controller options.
    #[serde(default)]
    pub(crate) controller: ControllerSection,
    /// Supervisor options.
    #[serde(default)]
    pub(crate) supervisor: SupervisorSection,
    /// Overrides for the persisted network policy.
    #[serde(default)]
    pub(crate) network: Option<NetConfigBuilder>,
}

/// `[logging]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoggingSection {
    /// Default tracing filter.
    #[serde(default = "default_filter")]
    pub(crate) filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            filter: default_filter(),
        }
    }
}

/// The default tracing filter.
fn default_filter() -> String {
    "info".to_owned()
}

/// `[controller]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ControllerSection {
    /// Preferred listen port.
    #[serde(default = "default_controller_port")]
    pub(crate) port: u16,
}

impl Default for ControllerSection {
    fn default() -> Self {
        ControllerSection {
            port: default_controller_port(),
        }
    }
}

/// The controller's conventional port.
fn default_controller_port() -> u16 {
    3210
}

/// `[supervisor]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SupervisorSection {
    /// Start the selected network's daemon at boot.
    #[serde(default)]
    pub(crate) autostart: bool,
    /// Publish a hidden service for the controller.
    #[serde(default = "default_true")]
    pub(crate) hidden_service: bool,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        SupervisorSection {
            autostart: false,
            hidden_service: true,
        }
    }
}

/// serde default helper.
fn default_true() -> bool {
    true
}

impl NightjarConfig {
    /// Load from a TOML file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: NightjarConfig = toml::from_str(&text).context("parsing TOML")?;
        Ok(config)
    }

    /// The state directory, defaulted under the home directory.
    pub(crate) fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".nightjar"),
            None => PathBuf::from("nightjar-state"),
        }
    }

    /// Build the `[network]` overrides, if the section is present.
    pub(crate) fn network_config(&self) -> Result<Option<NetConfig>> {
        match &self.network {
            Some(builder) => Ok(Some(builder.build().context("invalid [network] section")?)),
            None => Ok(None),
        }
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
    use nightjar_netcfg::RouteMode;

    #[test]
    fn empty_config_is_fine() {
        let config: NightjarConfig = toml::from_str("").unwrap();
        assert_eq!(config.controller.port, 3210);
        assert!(!config.supervisor.autostart);
        assert!(config.supervisor.hidden_service);
        assert!(config.network_config().unwrap().is_none());
    }

    #[test]
    fn full_config_parses() {
        let config: NightjarConfig = toml::from_str(
            r#"
            state_dir = "/tmp/nj"
            device_id = "dev-1"

            [logging]
            filter = "debug"

            [controller]
            port = 4000

            [supervisor]
            autostart = true

            [network]
            mode = "onionRouter"
            onion_proxy_url = "socks5h://127.0.0.1:9250"
            "#,
        )
        .unwrap();
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/nj"));
        assert_eq!(config.controller.port, 4000);
        let net = config.network_config().unwrap().unwrap();
        assert_eq!(net.mode(), RouteMode::OnionRouter);
        // The force rules are visible in the built config.
        assert!(net.disable_link_preview());
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<NightjarConfig>("frobnicate = 1").is_err());
    }
}
