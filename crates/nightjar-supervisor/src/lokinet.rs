//! The Lokinet daemon manager.
//!
//! Thinner than its Tor sibling: no bridges, no hidden-service restart
//! dance.  Lokinet publishes our `.loki` address on its own; we read it
//! from the daemon's data directory once it appears.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nightjar_installer::{Installer, OnionNetwork};
use nightjar_socks::ProxyUrl;
use tor_rtcompat::{NetStreamProvider, Runtime, SleepProvider};
use tracing::{debug, info};

use crate::err::SupervisorError;
use crate::process::ProcessHost;
use crate::status::{ComponentState, ComponentStatus, StatusChannel, StatusEvents, SupervisorStatus};
use crate::Result;

/// Conventional local SOCKS port for our managed lokinet.
const PREFERRED_SOCKS_PORT: u16 = 9260;

/// Default budget for the SOCKS port to come up.  Lokinet bootstraps
/// slower than tor on a cold cache.
const DEFAULT_STARTUP_BUDGET: Duration = Duration::from_secs(90);

/// Interval between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for a [`LokinetManager`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct LokinetConfig {
    /// Directory for lokinet's state and the generated config file.
    pub data_dir: PathBuf,
    /// SOCKS port to prefer; an ephemeral port is used if taken.
    pub preferred_socks_port: u16,
    /// Pin the SOCKS port exactly, skipping availability probing.
    pub fixed_socks_port: Option<u16>,
    /// Run this binary instead of the installed one.
    pub explicit_binary: Option<PathBuf>,
    /// How long to wait for the SOCKS port.
    pub startup_budget: Duration,
}

impl LokinetConfig {
    /// Reasonable defaults under `data_dir`.
    pub fn new(data_dir: PathBuf) -> Self {
        LokinetConfig {
            data_dir,
            preferred_socks_port: PREFERRED_SOCKS_PORT,
            fixed_socks_port: None,
            explicit_binary: None,
            startup_budget: DEFAULT_STARTUP_BUDGET,
        }
    }
}

/// Manages one Lokinet daemon.
pub struct LokinetManager<R: Runtime> {
    /// Runtime for dialing and sleeping.
    runtime: R,
    /// Source of the installed binary.
    installer: Arc<Installer>,
    /// Manager configuration.
    config: Mutex<LokinetConfig>,
    /// Status fan-out.
    status: StatusChannel,
    /// The running child, if any.
    process: Mutex<Option<ProcessHost>>,
}

impl<R: Runtime> LokinetManager<R> {
    /// Construct a manager; nothing is spawned until [`start`](Self::start).
    pub fn new(runtime: R, installer: Arc<Installer>, config: LokinetConfig) -> Self {
        LokinetManager {
            runtime,
            installer,
            config: Mutex::new(config),
            status: StatusChannel::new(),
            process: Mutex::new(None),
        }
    }

    /// The most recent status.
    pub fn status(&self) -> SupervisorStatus {
        self.status.latest()
    }

    /// Subscribe to status changes with replay.
    pub fn status_events(&self) -> StatusEvents {
        self.status.events()
    }

    /// Start the daemon and wait until its SOCKS port answers.
    pub async fn start(&self) -> Result<SupervisorStatus> {
        if self.status().is_running() {
            return Ok(self.status());
        }
        self.status.publish(SupervisorStatus::Starting);

        let binary = {
            let config = self.config.lock().expect("poisoned config lock");
            match &config.explicit_binary {
                Some(b) => b.clone(),
                None => match self.installer.read_current_pointer(OnionNetwork::Lokinet) {
                    Ok(Some(p)) => p.path,
                    _ => {
                        drop(config);
                        self.status.publish(SupervisorStatus::Unavailable);
                        return Err(SupervisorError::NotInstalled { network: "lokinet" });
                    }
                },
            }
        };

        match self.try_start_binary(&binary).await {
            Ok(status) => {
                self.status.publish(status.clone());
                Ok(status)
            }
            Err(e) => {
                self.status.publish(SupervisorStatus::Failed {
                    detail: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stop the daemon, if running.
    pub async fn stop(&self) {
        let process = self.process.lock().expect("poisoned process lock").take();
        if let Some(process) = process {
            process.stop(&self.runtime).await;
        }
        self.status.publish(SupervisorStatus::Stopped);
    }

    /// Combined install/run snapshot for health reporting.
    pub fn component_state(&self) -> ComponentState {
        let pointer = self
            .installer
            .read_current_pointer(OnionNetwork::Lokinet)
            .ok()
            .flatten();
        let status = self.status();
        let (phase, error) = match &status {
            SupervisorStatus::Running { .. } => (ComponentStatus::Ready, None),
            SupervisorStatus::Failed { detail } => {
                (ComponentStatus::Failed, Some(detail.clone()))
            }
            _ => (ComponentStatus::Idle, None),
        };
        ComponentState {
            installed: pointer.is_some(),
            version: pointer.as_ref().map(|p| p.version.clone()),
            status: phase,
            error,
            progress: None,
            binary_path: pointer.map(|p| p.path),
            socks_port: status.socks_proxy_url().map(|u| u.port()),
        }
    }

    /// One spawn-and-probe attempt.
    async fn try_start_binary(&self, binary: &Path) -> Result<SupervisorStatus> {
        let (config_path, socks_port, budget, data_dir) = {
            let config = self.config.lock().expect("poisoned config lock");
            std::fs::create_dir_all(&config.data_dir).map_err(|e| {
                SupervisorError::ConfigWrite {
                    network: "lokinet",
                    source: Arc::new(e),
                }
            })?;
            let socks_port = match config.fixed_socks_port {
                Some(p) => p,
                None => super::tor::pick_port(config.preferred_socks_port),
            };
            let rendered = render_config(&config.data_dir, socks_port);
            let config_path = config.data_dir.join("lokinet.ini");
            std::fs::write(&config_path, rendered).map_err(|e| SupervisorError::ConfigWrite {
                network: "lokinet",
                source: Arc::new(e),
            })?;
            (
                config_path,
                socks_port,
                config.startup_budget,
                config.data_dir.clone(),
            )
        };

        let host = ProcessHost::spawn(
            "lokinet",
            binary,
            &["--config".to_owned(), config_path.display().to_string()],
        )
        .map_err(|e| SupervisorError::SpawnFailed {
            program: binary.display().to_string(),
            source: Arc::new(e),
        })?;

        let addr: SocketAddr = ([127, 0, 0, 1], socks_port).into();
        let start = self.runtime.now();
        loop {
            if !host.is_alive() {
                return Err(SupervisorError::ExitedEarly {
                    network: "lokinet",
                    tail: host.tail(),
                });
            }
            match self.runtime.connect(&addr).await {
                Ok(stream) => {
                    drop(stream);
                    break;
                }
                Err(e) => debug!("lokinet socks port not ready yet: {}", e),
            }
            if self.runtime.now().saturating_duration_since(start) > budget {
                host.stop(&self.runtime).await;
                return Err(SupervisorError::ReadinessTimeout {
                    network: "lokinet",
                    budget_secs: budget.as_secs(),
                });
            }
            self.runtime.sleep(PROBE_INTERVAL).await;
        }

        let proxy: ProxyUrl = format!("socks5h://127.0.0.1:{socks_port}")
            .parse()
            .expect("constructed proxy URL is valid");
        let loki_addr = read_loki_address(&data_dir);

        *self.process.lock().expect("poisoned process lock") = Some(host);
        info!("lokinet is up; socks5h://127.0.0.1:{}", socks_port);

        Ok(SupervisorStatus::Running {
            socks_proxy_url: proxy,
            hidden_service_addr: loki_addr,
            detail: Some(format!("binary: {}", binary.display())),
        })
    }
}

/// Our published `.loki` address, if the daemon has written it yet.
fn read_loki_address(data_dir: &Path) -> Option<String> {
    let addr = std::fs::read_to_string(data_dir.join("self.loki")).ok()?;
    let addr = addr.trim();
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_owned())
    }
}

/// Render the lokinet configuration file.
fn render_config(data_dir: &Path, socks_port: u16) -> String {
    format!(
        "[router]\n\
         data-dir={}\n\
         \n\
         [api]\n\
         enabled=true\n\
         \n\
         [dns]\n\
         bind=127.0.0.1:0\n\
         \n\
         [network]\n\
         socks-port={}\n",
        data_dir.display(),
        socks_port
    )
}
