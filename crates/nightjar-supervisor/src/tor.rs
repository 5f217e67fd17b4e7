//! The Tor daemon manager.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nightjar_installer::{Installer, OnionNetwork};
use nightjar_socks::ProxyUrl;
use retry_error::RetryError;
use tor_rtcompat::{NetStreamProvider, Runtime, SleepProvider};
use tracing::{debug, info, warn};

use crate::bridges::{bridge_decision, country_code, BridgeDecision, DEFAULT_BRIDGE_LINES};
use crate::err::SupervisorError;
use crate::process::ProcessHost;
use crate::status::{ComponentState, ComponentStatus, StatusChannel, StatusEvents, SupervisorStatus};
use crate::Result;

/// Conventional local SOCKS port we try first for our managed tor.
///
/// Not 9050: a system tor may own that.
const PREFERRED_SOCKS_PORT: u16 = 9250;

/// Default budget for the SOCKS port to come up.
const DEFAULT_STARTUP_BUDGET: Duration = Duration::from_secs(60);

/// Interval between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Budget for the hidden-service hostname file to appear.
const HOSTNAME_BUDGET: Duration = Duration::from_secs(15);

/// Well-known system locations to try when the bundled tor fails on
/// macOS (the platform sometimes kills unsigned bundled binaries).
const DARWIN_FALLBACK_BINARIES: &[&str] = &[
    "/usr/local/bin/tor",
    "/opt/homebrew/bin/tor",
    "/opt/local/bin/tor",
];

/// A hidden service to publish: external virtual port mapped to a local
/// listener.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HiddenServiceConfig {
    /// The local port the controller listens on.
    pub local_port: u16,
    /// The port exposed on the onion address.
    pub virt_port: u16,
}

/// Configuration for a [`TorManager`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TorConfig {
    /// Directory for tor's state (`DataDirectory`), the generated torrc,
    /// and the hidden-service keys.
    pub data_dir: PathBuf,
    /// SOCKS port to prefer; an ephemeral port is used if taken.
    pub preferred_socks_port: u16,
    /// Pin the SOCKS port exactly, skipping availability probing.
    pub fixed_socks_port: Option<u16>,
    /// Hidden service to publish, if any.
    pub hidden_service: Option<HiddenServiceConfig>,
    /// `torBridgesMode = off`.
    pub bridges_off: bool,
    /// `torBridgesMode = force`.
    pub bridges_force: bool,
    /// Country override for the bridge policy.
    pub country_override: Option<String>,
    /// Run this binary instead of the installed one.
    pub explicit_binary: Option<PathBuf>,
    /// How long to wait for the SOCKS port.
    pub startup_budget: Duration,
}

impl TorConfig {
    /// Reasonable defaults under `data_dir`.
    pub fn new(data_dir: PathBuf) -> Self {
        TorConfig {
            data_dir,
            preferred_socks_port: PREFERRED_SOCKS_PORT,
            fixed_socks_port: None,
            hidden_service: None,
            bridges_off: false,
            bridges_force: false,
            country_override: None,
            explicit_binary: None,
            startup_budget: DEFAULT_STARTUP_BUDGET,
        }
    }
}

/// Details of the currently running daemon.
#[derive(Debug, Clone)]
struct RunningInfo {
    /// The SOCKS port in use.
    socks_port: u16,
    /// The torrc contents the daemon was started with.
    torrc: String,
    /// Which binary is running.
    binary: PathBuf,
}

/// Manages one Tor daemon: spawn, probe, publish, stop.
pub struct TorManager<R: Runtime> {
    /// Runtime for dialing, sleeping, and task time.
    runtime: R,
    /// Source of the installed binary (pointer file).
    installer: Arc<Installer>,
    /// Manager configuration.
    config: Mutex<TorConfig>,
    /// Status fan-out.
    status: StatusChannel,
    /// The running child, if any.
    process: Mutex<Option<ProcessHost>>,
    /// Bookkeeping about the running daemon.
    running: Mutex<Option<RunningInfo>>,
}

impl<R: Runtime> TorManager<R> {
    /// Construct a manager; nothing is spawned until [`start`](Self::start).
    pub fn new(runtime: R, installer: Arc<Installer>, config: TorConfig) -> Self {
        TorManager {
            runtime,
            installer,
            config: Mutex::new(config),
            status: StatusChannel::new(),
            process: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    /// The most recent status.
    pub fn status(&self) -> SupervisorStatus {
        self.status.latest()
    }

    /// Subscribe to status changes; the current status is replayed
    /// first.
    pub fn status_events(&self) -> StatusEvents {
        self.status.events()
    }

    /// Start the daemon and wait until its SOCKS port answers.
    ///
    /// Candidate binaries are tried in order (the installed one, then,
    /// on macOS, well-known system locations); each labeled failure is
    /// collected, and only if every candidate fails does the whole start
    /// fail.
    pub async fn start(&self) -> Result<SupervisorStatus> {
        if self.status().is_running() {
            return Ok(self.status());
        }
        self.status.publish(SupervisorStatus::Starting);

        let candidates = match self.candidate_binaries() {
            Ok(c) => c,
            Err(e) => {
                self.status.publish(SupervisorStatus::Unavailable);
                return Err(e);
            }
        };

        let mut attempts: RetryError<SupervisorError> =
            RetryError::in_attempt_to("start a tor daemon");
        for binary in candidates {
            match self.try_start_binary(&binary).await {
                Ok(status) => {
                    self.status.publish(status.clone());
                    return Ok(status);
                }
                Err(e) => {
                    warn!("tor candidate {:?} failed: {}", binary, e);
                    attempts.push(e);
                }
            }
        }

        let detail = attempts.to_string();
        self.status.publish(SupervisorStatus::Failed {
            detail: detail.clone(),
        });
        Err(SupervisorError::AllCandidatesFailed {
            network: "tor",
            detail,
        })
    }

    /// Stop the daemon, if running.
    pub async fn stop(&self) {
        let process = self.process.lock().expect("poisoned process lock").take();
        *self.running.lock().expect("poisoned running lock") = None;
        if let Some(process) = process {
            process.stop(&self.runtime).await;
        }
        self.status.publish(SupervisorStatus::Stopped);
    }

    /// Publish (or re-publish) a hidden service, returning its `.onion`
    /// address.
    ///
    /// Reconfigures and restarts the daemon if the hidden-service stanza
    /// changed, then polls the `hostname` file for up to fifteen
    /// seconds.
    pub async fn ensure_hidden_service(&self, hs: HiddenServiceConfig) -> Result<String> {
        let needs_restart = {
            let mut config = self.config.lock().expect("poisoned config lock");
            config.hidden_service = Some(hs);
            match self.running.lock().expect("poisoned running lock").as_ref() {
                Some(info) => {
                    let decision = self.bridges(&config);
                    let rendered =
                        render_torrc(&config, info.socks_port, decision, info.binary.parent());
                    rendered != info.torrc
                }
                None => false,
            }
        };

        if needs_restart {
            info!("hidden-service config changed; restarting tor");
            self.stop().await;
        }
        if !self.status().is_running() {
            self.start().await?;
        }

        let hostname_path = self.hostname_file();
        let deadline_polls = (HOSTNAME_BUDGET.as_millis() / 250) as u32;
        for _ in 0..deadline_polls {
            if let Ok(addr) = std::fs::read_to_string(&hostname_path) {
                let addr = addr.trim().to_owned();
                if !addr.is_empty() {
                    self.publish_hidden_addr(&addr);
                    return Ok(addr);
                }
            }
            self.runtime.sleep(Duration::from_millis(250)).await;
        }
        Err(SupervisorError::HiddenServiceTimeout {
            budget_secs: HOSTNAME_BUDGET.as_secs(),
        })
    }

    /// Combined install/run snapshot for health reporting.
    pub fn component_state(&self) -> ComponentState {
        let pointer = self
            .installer
            .read_current_pointer(OnionNetwork::Tor)
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

    /// The binaries to try, in order.
    fn candidate_binaries(&self) -> Result<Vec<PathBuf>> {
        let config = self.config.lock().expect("poisoned config lock");
        if let Some(explicit) = &config.explicit_binary {
            return Ok(vec![explicit.clone()]);
        }
        let mut candidates = Vec::new();
        match self.installer.read_current_pointer(OnionNetwork::Tor) {
            Ok(Some(pointer)) => candidates.push(pointer.path),
            Ok(None) | Err(_) => {}
        }
        if cfg!(target_os = "macos") {
            for fallback in DARWIN_FALLBACK_BINARIES {
                let p = PathBuf::from(fallback);
                if p.is_file() {
                    candidates.push(p);
                }
            }
        }
        if candidates.is_empty() {
            return Err(SupervisorError::NotInstalled { network: "tor" });
        }
        Ok(candidates)
    }

    /// One spawn-and-probe attempt with a specific binary.
    async fn try_start_binary(&self, binary: &Path) -> Result<SupervisorStatus> {
        let (torrc_path, torrc, socks_port, budget) = {
            let config = self.config.lock().expect("poisoned config lock");
            std::fs::create_dir_all(&config.data_dir).map_err(|e| {
                SupervisorError::ConfigWrite {
                    network: "tor",
                    source: Arc::new(e),
                }
            })?;
            let socks_port = match config.fixed_socks_port {
                Some(p) => p,
                None => pick_port(config.preferred_socks_port),
            };
            let decision = self.bridges(&config);
            let torrc = render_torrc(&config, socks_port, decision, binary.parent());
            let torrc_path = config.data_dir.join("torrc");
            std::fs::write(&torrc_path, &torrc).map_err(|e| SupervisorError::ConfigWrite {
                network: "tor",
                source: Arc::new(e),
            })?;
            (torrc_path, torrc, socks_port, config.startup_budget)
        };

        let host = ProcessHost::spawn(
            "tor",
            binary,
            &["-f".to_owned(), torrc_path.display().to_string()],
        )
        .map_err(|e| SupervisorError::SpawnFailed {
            program: binary.display().to_string(),
            source: Arc::new(e),
        })?;

        match self.await_socks_ready(&host, socks_port, budget).await {
            Ok(()) => {}
            Err(e) => {
                host.stop(&self.runtime).await;
                return Err(e);
            }
        }

        let proxy: ProxyUrl = format!("socks5h://127.0.0.1:{socks_port}")
            .parse()
            .expect("constructed proxy URL is valid");
        let hidden = std::fs::read_to_string(self.hostname_file())
            .ok()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty());

        *self.process.lock().expect("poisoned process lock") = Some(host);
        *self.running.lock().expect("poisoned running lock") = Some(RunningInfo {
            socks_port,
            torrc,
            binary: binary.to_path_buf(),
        });
        info!("tor is up; socks5h://127.0.0.1:{}", socks_port);

        Ok(SupervisorStatus::Running {
            socks_proxy_url: proxy,
            hidden_service_addr: hidden,
            detail: Some(format!("binary: {}", binary.display())),
        })
    }

    /// Poll the SOCKS port until it accepts, watching for early exit.
    async fn await_socks_ready(
        &self,
        host: &ProcessHost,
        socks_port: u16,
        budget: Duration,
    ) -> Result<()> {
        let addr: SocketAddr = ([127, 0, 0, 1], socks_port).into();
        let start = self.runtime.now();
        loop {
            if !host.is_alive() {
                return Err(SupervisorError::ExitedEarly {
                    network: "tor",
                    tail: host.tail(),
                });
            }
            match self.runtime.connect(&addr).await {
                Ok(stream) => {
                    drop(stream);
                    return Ok(());
                }
                Err(e) => {
                    debug!("tor socks port not ready yet: {}", e);
                }
            }
            if self.runtime.now().saturating_duration_since(start) > budget {
                return Err(SupervisorError::ReadinessTimeout {
                    network: "tor",
                    budget_secs: budget.as_secs(),
                });
            }
            self.runtime.sleep(PROBE_INTERVAL).await;
        }
    }

    /// The bridge decision for the current config.
    fn bridges(&self, config: &TorConfig) -> BridgeDecision {
        bridge_decision(
            config.bridges_off,
            config.bridges_force,
            country_code(config.country_override.as_deref()).as_deref(),
        )
    }

    /// Where tor writes the hidden-service hostname.
    fn hostname_file(&self) -> PathBuf {
        let config = self.config.lock().expect("poisoned config lock");
        config.data_dir.join("hidden_service").join("hostname")
    }

    /// Update a `Running` status with a freshly learned onion address.
    fn publish_hidden_addr(&self, addr: &str) {
        if let SupervisorStatus::Running {
            socks_proxy_url,
            detail,
            ..
        } = self.status()
        {
            self.status.publish(SupervisorStatus::Running {
                socks_proxy_url,
                hidden_service_addr: Some(addr.to_owned()),
                detail,
            });
        }
    }
}

/// Choose a local port: the preferred one if free, else OS-assigned.
pub(crate) fn pick_port(preferred: u16) -> u16 {
    if std::net::TcpListener::bind(("127.0.0.1", preferred)).is_ok() {
        return preferred;
    }
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap_or(preferred)
}

/// Render the torrc for this configuration.
fn render_torrc(
    config: &TorConfig,
    socks_port: u16,
    bridges: BridgeDecision,
    binary_dir: Option<&Path>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "DataDirectory {}\n",
        config.data_dir.display()
    ));
    out.push_str(&format!("SocksPort 127.0.0.1:{socks_port}\n"));
    out.push_str("SafeSocks 1\n");
    out.push_str("ClientOnly 1\n");
    out.push_str("Log notice stdout\n");

    if let Some(hs) = &config.hidden_service {
        out.push_str(&format!(
            "HiddenServiceDir {}\n",
            config.data_dir.join("hidden_service").display()
        ));
        out.push_str(&format!(
            "HiddenServicePort {} 127.0.0.1:{}\n",
            hs.virt_port, hs.local_port
        ));
    }

    if !matches!(bridges, BridgeDecision::Off) {
        out.push_str("UseBridges 1\n");
        // The obfs4 lines only help if the transport helper is bundled
        // next to the tor binary.
        let lyrebird = binary_dir
            .map(|d| d.join("pluggable_transports").join("lyrebird"))
            .filter(|p| p.is_file());
        if let Some(lyrebird) = lyrebird {
            out.push_str(&format!(
                "ClientTransportPlugin obfs4,webtunnel exec {}\n",
                lyrebird.display()
            ));
            for line in DEFAULT_BRIDGE_LINES {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
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
    use fs_mistrust::Mistrust;
    use futures::StreamExt;
    use tor_rtcompat::NetStreamListener;

    fn installer(tmp: &tempfile::TempDir) -> Arc<Installer> {
        Arc::new(
            Installer::open(
                &tmp.path().join("onion"),
                &Mistrust::new_dangerously_trust_everyone(),
            )
            .unwrap(),
        )
    }

    /// Write an executable shell script and return its path.
    #[cfg(unix)]
    fn script(tmp: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = tmp.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn torrc_rendering() {
        let mut config = TorConfig::new(PathBuf::from("/var/lib/nj"));
        let torrc = render_torrc(&config, 9250, BridgeDecision::Off, None);
        assert!(torrc.contains("DataDirectory /var/lib/nj\n"));
        assert!(torrc.contains("SocksPort 127.0.0.1:9250\n"));
        assert!(torrc.contains("SafeSocks 1\n"));
        assert!(!torrc.contains("HiddenService"));
        assert!(!torrc.contains("UseBridges"));

        config.hidden_service = Some(HiddenServiceConfig {
            local_port: 3210,
            virt_port: 80,
        });
        let torrc = render_torrc(&config, 9250, BridgeDecision::Off, None);
        assert!(torrc.contains("HiddenServiceDir /var/lib/nj/hidden_service\n"));
        assert!(torrc.contains("HiddenServicePort 80 127.0.0.1:3210\n"));

        // Bridges without a bundled helper: UseBridges only.
        let torrc = render_torrc(&config, 9250, BridgeDecision::Force, None);
        assert!(torrc.contains("UseBridges 1\n"));
        assert!(!torrc.contains("ClientTransportPlugin"));
    }

    #[test]
    fn pick_port_prefers_free_port() {
        // An ephemeral port we know is free right now.
        let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let free = probe.local_addr().unwrap().port();
        drop(probe);
        assert_eq!(pick_port(free), free);

        // An occupied port gets an ephemeral replacement.
        let holder = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();
        let picked = pick_port(taken);
        assert_ne!(picked, taken);
    }

    #[test]
    fn not_installed() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            let mgr = TorManager::new(
                rt.clone(),
                installer(&tmp),
                TorConfig::new(tmp.path().join("data")),
            );
            let err = mgr.start().await.unwrap_err();
            assert!(matches!(err, SupervisorError::NotInstalled { .. }));
            assert_eq!(mgr.status(), SupervisorStatus::Unavailable);
        });
    }

    #[cfg(unix)]
    #[test]
    fn early_exit_is_reported_with_tail() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            let fake = script(&tmp, "fake-tor", "echo catastrophic config failure; exit 1");
            let mut config = TorConfig::new(tmp.path().join("data"));
            config.explicit_binary = Some(fake);
            config.startup_budget = Duration::from_secs(5);
            let mgr = TorManager::new(rt.clone(), installer(&tmp), config);

            let err = mgr.start().await.unwrap_err();
            let detail = err.to_string();
            assert!(detail.contains("catastrophic config failure"), "{detail}");
            assert!(matches!(
                mgr.status(),
                SupervisorStatus::Failed { .. }
            ));
        });
    }

    #[cfg(unix)]
    #[test]
    fn readiness_timeout() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            // Alive but never listens.
            let fake = script(&tmp, "fake-tor", "sleep 60");
            let mut config = TorConfig::new(tmp.path().join("data"));
            config.explicit_binary = Some(fake);
            config.startup_budget = Duration::from_millis(1200);
            let mgr = TorManager::new(rt.clone(), installer(&tmp), config);

            let err = mgr.start().await.unwrap_err();
            assert!(err.to_string().contains("not ready"), "{err}");
        });
    }

    #[cfg(unix)]
    #[test]
    fn start_succeeds_when_socks_port_answers() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            // The "daemon" stays alive; the test itself provides the
            // listening SOCKS port.
            let listener = rt.listen(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap()).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            futures::task::SpawnExt::spawn(&rt, async move {
                let mut incoming = listener.incoming();
                while let Some(Ok((stream, _))) = incoming.next().await {
                    drop(stream);
                }
            })
            .unwrap();

            let fake = script(&tmp, "fake-tor", "sleep 60");
            let mut config = TorConfig::new(tmp.path().join("data"));
            config.explicit_binary = Some(fake);
            config.fixed_socks_port = Some(port);
            config.startup_budget = Duration::from_secs(5);
            let mgr = TorManager::new(rt.clone(), installer(&tmp), config);

            let status = mgr.start().await.unwrap();
            assert!(status.is_running());
            let url = status.socks_proxy_url().unwrap();
            assert_eq!(url.port(), port);

            // Status events replay the running state.
            let mut events = mgr.status_events();
            assert!(events.next().await.unwrap().is_running());

            // A second start is a no-op.
            assert!(mgr.start().await.unwrap().is_running());

            mgr.stop().await;
            assert_eq!(mgr.status(), SupervisorStatus::Stopped);
        });
    }

    #[cfg(unix)]
    #[test]
    fn hidden_service_address_polling() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            let listener = rt.listen(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap()).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            futures::task::SpawnExt::spawn(&rt, async move {
                let mut incoming = listener.incoming();
                while let Some(Ok((stream, _))) = incoming.next().await {
                    drop(stream);
                }
            })
            .unwrap();

            let data_dir = tmp.path().join("data");
            // Pre-publish what tor would eventually write.
            std::fs::create_dir_all(data_dir.join("hidden_service")).unwrap();
            std::fs::write(
                data_dir.join("hidden_service").join("hostname"),
                "vvvvvvvvvvvvvvvv.onion\n",
            )
            .unwrap();

            let fake = script(&tmp, "fake-tor", "sleep 60");
            let mut config = TorConfig::new(data_dir);
            config.explicit_binary = Some(fake);
            config.fixed_socks_port = Some(port);
            config.startup_budget = Duration::from_secs(5);
            config.hidden_service = Some(HiddenServiceConfig {
                local_port: 3210,
                virt_port: 80,
            });
            let mgr = TorManager::new(rt.clone(), installer(&tmp), config);

            let addr = mgr
                .ensure_hidden_service(HiddenServiceConfig {
                    local_port: 3210,
                    virt_port: 80,
                })
                .await
                .unwrap();
            assert_eq!(addr, "vvvvvvvvvvvvvvvv.onion");
            assert_eq!(
                mgr.status().hidden_service_addr(),
                Some("vvvvvvvvvvvvvvvv.onion")
            );
            mgr.stop().await;
        });
    }
}
