//! Tunnels: VPN Controller
//!
//! Main entry point. Installs the global allocator and logging, loads the
//! configuration, picks the OS VPN backend and runs the controller with a
//! control console until quit or Ctrl-C.

mod console;
mod swanctl;
mod wake;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunnels_vpn::{
    ClientIdentity, HttpProbe, ManualReachability, MemoryBackend, NetworkSetupProxy,
    NoSystemProxy, ReachabilityGate, SystemProxy, Trigger, VpnBackend, VpnConfig, VpnController,
};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How often the swanctl backend polls SA state
const SA_POLL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "tunnels", version, about = "IKEv2 VPN controller with whitelist proxy")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "TUNNELS_CONFIG")]
    config: Option<PathBuf>,

    /// Simulate the OS VPN stack and network instead of driving swanctl
    #[arg(long)]
    simulate: bool,

    /// swanctl configuration directory
    #[arg(long, default_value = "/etc/swanctl")]
    swanctl_dir: PathBuf,

    /// Network service whose proxy settings require-VPN mode manages
    #[arg(long, default_value = "Wi-Fi")]
    network_service: String,

    /// Client identifier issued by the account service
    #[arg(long, env = "TUNNELS_CLIENT_ID")]
    client_id: Option<String>,

    /// File holding the base64 client certificate
    #[arg(long, env = "TUNNELS_CERTIFICATE")]
    certificate: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    info!("Tunnels starting...");

    let config = match &cli.config {
        Some(path) => VpnConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => VpnConfig::default(),
    };
    info!("Data directory: {}", config.data_dir.display());

    let mut background = Vec::new();
    let (backend, reachability, system_proxy): (
        Arc<dyn VpnBackend>,
        Arc<dyn ReachabilityGate>,
        Arc<dyn SystemProxy>,
    ) = if cli.simulate {
        info!("Simulation mode: in-memory VPN backend, network always reachable");
        (
            Arc::new(MemoryBackend::new()),
            Arc::new(ManualReachability::new(true)),
            Arc::new(NoSystemProxy),
        )
    } else {
        let paths = swanctl::SwanctlPaths::new(&config.data_dir, &cli.swanctl_dir);
        let backend = Arc::new(swanctl::SwanctlBackend::new(paths));
        background.push(backend.spawn_monitor(SA_POLL));

        let system_proxy: Arc<dyn SystemProxy> = if cfg!(target_os = "macos") {
            Arc::new(NetworkSetupProxy::new(cli.network_service.clone()))
        } else {
            Arc::new(NoSystemProxy)
        };
        (
            backend,
            Arc::new(HttpProbe::new(&config.reachability)?),
            system_proxy,
        )
    };

    let vpn = VpnController::start(config, backend, reachability, system_proxy)
        .await
        .context("starting VPN controller")?;

    match read_certificate(&cli).await? {
        Some((client_id, encoded)) => {
            if let Err(e) = vpn.install_identity(&client_id, &encoded).await {
                warn!("Client identity not installed: {}", e);
            }
        }
        None if cli.simulate => {
            vpn.set_identity(ClientIdentity::new("simulated-client", vec![0u8; 32])?)
                .await?;
        }
        None => warn!("No client identity; connect will fail until one is provided"),
    }

    let handle = vpn.reconcile_handle().clone();
    background.push(wake::spawn_wake_detector(move || handle.trigger(Trigger::Wake)));

    tokio::select! {
        _ = console::run(&vpn) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    for task in background {
        task.abort();
    }
    vpn.shutdown().await?;
    info!("Tunnels shutting down");
    Ok(())
}

/// Client id and base64 certificate from the command line. Validation is
/// left to the controller, which grounds the tunnel on a bad certificate.
async fn read_certificate(cli: &Cli) -> Result<Option<(String, String)>> {
    let (Some(client_id), Some(path)) = (&cli.client_id, &cli.certificate) else {
        return Ok(None);
    };
    let encoded = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(Some((client_id.clone(), encoded)))
}
