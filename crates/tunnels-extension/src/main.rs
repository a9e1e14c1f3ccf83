//! Packet tunnel extension process
//!
//! Brings the data path up, serves the loopback proxy until the OS
//! signals shutdown, then tears it down.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunnels_extension::{FileSettingsSink, TunnelExtension};
use tunnels_vpn::VpnConfig;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let config = match std::env::var_os("TUNNELS_CONFIG") {
        Some(path) => VpnConfig::from_toml_file(path.as_ref()).context("loading configuration")?,
        None => VpnConfig::default(),
    };

    let sink = Arc::new(FileSettingsSink::new(
        config.data_dir.join("tunnel-network-settings.json"),
    ));
    let extension = TunnelExtension::new(&config, sink);

    extension.start_tunnel().await.context("starting packet tunnel")?;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    extension.stop_tunnel().await.context("stopping packet tunnel")?;
    Ok(())
}
