//! Tunnels Packet Tunnel Extension
//!
//! Runs while the OS has the tunnel up. It reads the same whitelist store
//! as the controller, hands the OS the network settings for the data path
//! (addresses, MTU, proxy settings and PAC), and runs the loopback proxy
//! that whitelisted traffic is sent to.
//!
//! ```text
//! whitelist.json ──▶ CompiledWhitelist ──▶ TunnelNetworkSettings ──▶ NetworkSettingsSink
//!                                                                   then
//!                                          ProxyLifecycle::start (127.0.0.1:9090)
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tunnels_vpn::{
    CompiledWhitelist, ProxyEndpoint, ProxyError, ProxyLifecycle, VpnConfig, WhitelistError,
    WhitelistStore,
};

/// Remote address reported for the tunnel
pub const TUNNEL_REMOTE_ADDRESS: &str = "127.0.0.1";

/// Interface address inside the tunnel
pub const TUNNEL_IPV4_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 8);

/// Interface netmask
pub const TUNNEL_IPV4_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Tunnel MTU
pub const TUNNEL_MTU: u16 = 1500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Settings {
    pub addresses: Vec<Ipv4Addr>,
    pub subnet_masks: Vec<Ipv4Addr>,
}

/// Proxy settings pushed with the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub http_server: ProxyEndpoint,
    pub http_enabled: bool,
    pub https_server: ProxyEndpoint,
    pub https_enabled: bool,
    /// Domains the proxy settings apply to
    pub match_domains: Vec<String>,
    pub auto_proxy_configuration_enabled: bool,
    pub proxy_auto_configuration_javascript: String,
}

/// Everything the OS needs to bring up the data path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelNetworkSettings {
    pub tunnel_remote_address: String,
    pub ipv4: Ipv4Settings,
    pub mtu: u16,
    pub proxy: ProxySettings,
}

impl TunnelNetworkSettings {
    /// Settings for a compiled whitelist
    pub fn build(compiled: &CompiledWhitelist, endpoint: ProxyEndpoint) -> Self {
        Self {
            tunnel_remote_address: TUNNEL_REMOTE_ADDRESS.to_string(),
            ipv4: Ipv4Settings {
                addresses: vec![TUNNEL_IPV4_ADDRESS],
                subnet_masks: vec![TUNNEL_IPV4_MASK],
            },
            mtu: TUNNEL_MTU,
            proxy: ProxySettings {
                http_server: endpoint,
                http_enabled: true,
                https_server: endpoint,
                https_enabled: true,
                match_domains: compiled.domain_list(),
                auto_proxy_configuration_enabled: true,
                proxy_auto_configuration_javascript: compiled.pac.clone(),
            },
        }
    }
}

/// Where network settings go (the OS packet-tunnel provider)
#[async_trait]
pub trait NetworkSettingsSink: Send + Sync {
    /// Apply settings; `None` clears them
    async fn apply(&self, settings: Option<&TunnelNetworkSettings>) -> Result<(), ExtensionError>;
}

/// Writes the settings as JSON for the OS integration to pick up
#[derive(Debug, Clone)]
pub struct FileSettingsSink {
    path: PathBuf,
}

impl FileSettingsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NetworkSettingsSink for FileSettingsSink {
    async fn apply(&self, settings: Option<&TunnelNetworkSettings>) -> Result<(), ExtensionError> {
        match settings {
            Some(settings) => {
                let json = serde_json::to_vec_pretty(settings)
                    .map_err(|e| ExtensionError::Sink(e.to_string()))?;
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ExtensionError::Sink(e.to_string()))?;
                }
                tokio::fs::write(&self.path, json)
                    .await
                    .map_err(|e| ExtensionError::Sink(e.to_string()))?;
                debug!("Network settings written to {}", self.path.display());
            }
            None => match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ExtensionError::Sink(e.to_string())),
            },
        }
        Ok(())
    }
}

/// Packet tunnel provider
pub struct TunnelExtension {
    endpoint: ProxyEndpoint,
    whitelist: WhitelistStore,
    proxy: ProxyLifecycle,
    sink: Arc<dyn NetworkSettingsSink>,
}

impl TunnelExtension {
    pub fn new(config: &VpnConfig, sink: Arc<dyn NetworkSettingsSink>) -> Self {
        Self {
            endpoint: config.proxy,
            whitelist: WhitelistStore::new(config.whitelist_path()),
            proxy: ProxyLifecycle::for_endpoint(&config.proxy),
            sink,
        }
    }

    /// Is the loopback proxy up?
    pub fn is_proxy_running(&self) -> bool {
        self.proxy.is_running()
    }

    /// OS asked to start the tunnel
    pub async fn start_tunnel(&self) -> Result<TunnelNetworkSettings, ExtensionError> {
        info!("Starting packet tunnel");
        self.proxy.stop().await;

        let list = self.whitelist.load()?;
        let compiled = CompiledWhitelist::compile(&list, &self.endpoint);
        let settings = TunnelNetworkSettings::build(&compiled, self.endpoint);
        self.sink.apply(Some(&settings)).await?;

        self.proxy.start().await?;
        info!(
            "Packet tunnel up, {} whitelisted domains via {}",
            compiled.domains.len(),
            self.endpoint
        );
        Ok(settings)
    }

    /// OS asked to stop the tunnel
    pub async fn stop_tunnel(&self) -> Result<(), ExtensionError> {
        info!("Stopping packet tunnel");
        self.proxy.stop().await;
        self.sink.apply(None).await
    }

    /// Message from the controller; echoed back
    pub fn handle_app_message(&self, message: &[u8]) -> Vec<u8> {
        debug!("App message ({} bytes)", message.len());
        message.to_vec()
    }
}

/// Extension errors
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("Whitelist error: {0}")]
    Whitelist(#[from] WhitelistError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Failed to apply network settings: {0}")]
    Sink(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tunnels_vpn::Whitelist;

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<Option<TunnelNetworkSettings>>>,
    }

    #[async_trait]
    impl NetworkSettingsSink for RecordingSink {
        async fn apply(&self, settings: Option<&TunnelNetworkSettings>) -> Result<(), ExtensionError> {
            self.applied.lock().unwrap().push(settings.cloned());
            Ok(())
        }
    }

    fn config(dir: &tempfile::TempDir) -> VpnConfig {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = VpnConfig {
            data_dir: dir.path().to_path_buf(),
            ..VpnConfig::default()
        };
        config.proxy.port = port;
        config
    }

    #[test]
    fn test_network_settings_shape() {
        let mut list = Whitelist::new();
        list.add_user_domain("example.com").unwrap();
        let compiled = CompiledWhitelist::compile(&list, &ProxyEndpoint::default());

        let settings = TunnelNetworkSettings::build(&compiled, ProxyEndpoint::default());
        assert_eq!(settings.tunnel_remote_address, "127.0.0.1");
        assert_eq!(settings.ipv4.addresses, vec![Ipv4Addr::new(10, 0, 0, 8)]);
        assert_eq!(settings.ipv4.subnet_masks, vec![Ipv4Addr::new(255, 255, 255, 0)]);
        assert_eq!(settings.mtu, 1500);
        assert_eq!(settings.proxy.match_domains, vec!["*.example.com".to_string()]);
        assert_eq!(settings.proxy.http_server.to_string(), "127.0.0.1:9090");
        assert!(settings.proxy.auto_proxy_configuration_enabled);
        assert_eq!(settings.proxy.proxy_auto_configuration_javascript, compiled.pac);
    }

    #[tokio::test]
    async fn test_start_and_stop_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        WhitelistStore::new(config.whitelist_path())
            .update(|list| list.add_user_domain("example.com").map(|_| ()))
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let extension = TunnelExtension::new(&config, sink.clone());

        let settings = extension.start_tunnel().await.unwrap();
        assert!(extension.is_proxy_running());
        assert!(settings.proxy.proxy_auto_configuration_javascript.contains("example.com"));

        // Restart reuses the same port
        extension.start_tunnel().await.unwrap();
        assert!(extension.is_proxy_running());

        extension.stop_tunnel().await.unwrap();
        assert!(!extension.is_proxy_running());

        let applied = sink.applied.lock().unwrap();
        assert_eq!(applied.len(), 3);
        assert!(applied[2].is_none());
    }

    #[tokio::test]
    async fn test_file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        let sink = FileSettingsSink::new(&path);
        let compiled = CompiledWhitelist::compile(&Whitelist::new(), &ProxyEndpoint::default());
        let settings = TunnelNetworkSettings::build(&compiled, ProxyEndpoint::default());

        sink.apply(Some(&settings)).await.unwrap();
        let written: TunnelNetworkSettings =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, settings);

        sink.apply(None).await.unwrap();
        assert!(!path.exists());
        sink.apply(None).await.unwrap();
    }

    #[test]
    fn test_app_message_echo() {
        let dir = tempfile::tempdir().unwrap();
        let extension = TunnelExtension::new(&config(&dir), Arc::new(RecordingSink::default()));
        assert_eq!(extension.handle_app_message(b"ping"), b"ping".to_vec());
    }
}
