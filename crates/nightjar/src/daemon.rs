//! Wiring: stores, supervisor, controller, router, scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tor_rtcompat::Runtime;
use tracing::{info, warn};

use nightjar_ctrl::{ControllerConfig, EndpointInfo, LocalOnionController, ProxyDirectory};
use nightjar_envelope::DeviceId;
use nightjar_installer::Installer;
use nightjar_netcfg::{NetConfigStore, NetworkKind};
use nightjar_outbox::{OutboxStore, SchedulerConfig};
use nightjar_routes::{
    OnionRouterConfig, OnionRouterTransport, PeerDirectory, RouteController, Router, Transport,
};
use nightjar_socks::HttpClient;
use nightjar_supervisor::{
    HiddenServiceConfig, LokinetConfig, LokinetManager, SupervisorStatus, TorConfig, TorManager,
};

use crate::cfg::NightjarConfig;

/// A [`ProxyDirectory`] view over the two supervised managers.
struct ManagerDirectory<R: Runtime> {
    /// The Tor manager.
    tor: Arc<TorManager<R>>,
    /// The Lokinet manager.
    lokinet: Arc<LokinetManager<R>>,
    /// The live network policy (for the selected network).
    netcfg: Arc<NetConfigStore>,
}

impl<R: Runtime> ManagerDirectory<R> {
    /// Render one manager status as endpoint info.
    fn info_of(status: &SupervisorStatus) -> EndpointInfo {
        EndpointInfo {
            active: status.is_running(),
            proxy: status.socks_proxy_url().cloned(),
            address: status.hidden_service_addr().map(str::to_owned),
            details: match status {
                SupervisorStatus::Failed { detail } => detail.clone(),
                SupervisorStatus::Running { detail, .. } => {
                    detail.clone().unwrap_or_default()
                }
                other => format!("{other:?}"),
            },
        }
    }
}

impl<R: Runtime> ProxyDirectory for ManagerDirectory<R> {
    fn tor(&self) -> EndpointInfo {
        Self::info_of(&self.tor.status())
    }

    fn lokinet(&self) -> EndpointInfo {
        Self::info_of(&self.lokinet.status())
    }

    fn selected(&self) -> String {
        self.netcfg
            .current()
            .onion_selected_network()
            .as_str()
            .to_owned()
    }
}

/// Run the daemon until a termination signal arrives.
pub(crate) async fn run<R: Runtime>(runtime: R, config: NightjarConfig) -> Result<()> {
    let state_dir = config.state_dir();
    info!("nightjar starting; state in {}", state_dir.display());

    let mistrust = if std::env::var_os("NIGHTJAR_FS_DISABLE_PERMISSION_CHECKS").is_some() {
        fs_mistrust::Mistrust::new_dangerously_trust_everyone()
    } else {
        fs_mistrust::Mistrust::new()
    };

    // Stores.
    let netcfg = Arc::new(
        NetConfigStore::open(&state_dir, &mistrust).context("opening network policy store")?,
    );
    if let Some(overrides) = config.network_config()? {
        netcfg
            .replace(overrides)
            .context("applying [network] overrides")?;
    }
    let outbox = Arc::new(
        OutboxStore::open(&state_dir.join("outbox"), &mistrust).context("opening outbox")?,
    );
    let installer = Arc::new(
        Installer::open(&state_dir.join("onion"), &mistrust).context("opening component tree")?,
    );

    // Supervised daemons.
    let tor = Arc::new(TorManager::new(
        runtime.clone(),
        Arc::clone(&installer),
        TorConfig::new(state_dir.join("onion").join("tor-data")),
    ));
    let lokinet = Arc::new(LokinetManager::new(
        runtime.clone(),
        Arc::clone(&installer),
        LokinetConfig::new(state_dir.join("onion").join("lokinet-data")),
    ));

    if config.supervisor.autostart {
        let selected = netcfg.current().onion_selected_network();
        match selected {
            NetworkKind::Lokinet => {
                let lokinet = Arc::clone(&lokinet);
                let _ = futures::task::SpawnExt::spawn(&runtime, async move {
                    if let Err(e) = lokinet.start().await {
                        warn!("lokinet autostart failed: {}", e);
                    }
                });
            }
            _ => {
                let tor = Arc::clone(&tor);
                let hs = config.supervisor.hidden_service;
                let controller_port = config.controller.port;
                let _ = futures::task::SpawnExt::spawn(&runtime, async move {
                    match tor.start().await {
                        Ok(_) if hs => {
                            if let Err(e) = tor
                                .ensure_hidden_service(HiddenServiceConfig {
                                    local_port: controller_port,
                                    virt_port: 80,
                                })
                                .await
                            {
                                warn!("hidden-service bootstrap failed: {}", e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("tor autostart failed: {}", e),
                    }
                });
            }
        }
    }

    // Controller.
    let directory: Arc<dyn ProxyDirectory> = Arc::new(ManagerDirectory {
        tor: Arc::clone(&tor),
        lokinet: Arc::clone(&lokinet),
        netcfg: Arc::clone(&netcfg),
    });
    let mut forward_client = HttpClient::new(runtime.clone());
    forward_client.set_egress_gate(Arc::new(netcfg.egress_gate()));
    let controller = LocalOnionController::new(
        runtime.clone(),
        ControllerConfig {
            preferred_port: config.controller.port,
            ..Default::default()
        },
        forward_client,
        Arc::clone(&directory),
    );
    let controller_handle = controller.launch().await.context("starting controller")?;
    let controller_addr = controller_handle.local_addr();

    // Router and transports.
    let own_device = DeviceId::new(
        config
            .device_id
            .clone()
            .unwrap_or_else(|| "unconfigured-device".to_owned()),
    );
    let peers = Arc::new(PeerDirectory::new());
    let router = Router::new(
        runtime.clone(),
        Arc::clone(&outbox),
        Arc::clone(&peers),
        Arc::new(RouteController::new()),
        Arc::clone(&netcfg),
    );
    let onion_transport: Arc<dyn Transport> = Arc::new(OnionRouterTransport::new(
        runtime.clone(),
        HttpClient::new(runtime.clone()),
        OnionRouterConfig {
            controller_addr,
            own_device,
            preferred_network: netcfg.current().onion_selected_network(),
        },
        Arc::clone(&peers),
    ));
    onion_transport
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("starting onion transport: {e}"))?;
    router.add_transport(onion_transport);
    // The direct-p2p and self-onion transports plug in here once the
    // peer-connection and relay layers hand us their seams.

    let scheduler = router
        .launch(SchedulerConfig::default())
        .context("launching scheduler")?;

    // Surface deliveries; the presentation layer attaches here.
    if let Some(mut deliveries) = router.take_deliveries() {
        let _ = futures::task::SpawnExt::spawn(&runtime, async move {
            while let Some(delivery) = deliveries.next().await {
                info!(
                    "envelope delivered from {:?}",
                    delivery.from.as_ref().map(|d| d.to_string())
                );
            }
        });
    }

    info!("nightjar is up; controller at {}", controller_addr);
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    scheduler.stop();
    controller_handle.shutdown();
    tor.stop().await;
    lokinet.stop().await;
    Ok(())
}
