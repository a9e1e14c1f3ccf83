//! Controller Configuration
//!
//! Static configuration for the VPN controller, loaded from TOML.
//! Every field has a default so an empty file is a valid config.
//!
//! ```toml
//! vpn_name = "Confirmed VPN"
//! vpn_domain = "confirmedvpn.com"
//!
//! [proxy]
//! host = "127.0.0.1"
//! port = 9090
//!
//! [timings]
//! reconcile_interval_secs = 10
//! reconnect_throttle_secs = 5
//! stuck_connecting_secs = 5
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Loopback address both the controller and the tunnel extension
/// advertise the local proxy on.
pub const DEFAULT_PROXY_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Local proxy port shared with the tunnel extension.
pub const DEFAULT_PROXY_PORT: u16 = 9090;

/// Local proxy endpoint (HTTP and HTTPS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyEndpoint {
    /// Listen address, always loopback in practice
    pub host: IpAddr,
    /// Listen port
    pub port: u16,
}

impl ProxyEndpoint {
    /// Socket address to bind
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// `PROXY host:port` directive used in PAC scripts
    pub fn pac_directive(&self) -> String {
        format!("PROXY {}:{}", self.host, self.port)
    }
}

impl Default for ProxyEndpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_PROXY_HOST,
            port: DEFAULT_PROXY_PORT,
        }
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Timers and thresholds used by the reconciliation loop.
///
/// The reconnect throttle and the stuck-connecting bound are independent;
/// nothing requires them to be equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileTimings {
    /// Periodic reconciliation interval
    pub reconcile_interval_secs: u64,
    /// Minimum spacing between tunnel reconnect attempts
    pub reconnect_throttle_secs: u64,
    /// How long a tunnel may sit in Connecting before it is restarted
    pub stuck_connecting_secs: u64,
    /// Delay between the forced stop and the restart of a stuck tunnel
    pub stuck_restart_delay_secs: u64,
    /// Early retry after a pass found the network unreachable
    pub unreachable_retry_secs: u64,
    /// Poll interval of the reachability edge detector
    pub reachability_poll_secs: u64,
}

impl ReconcileTimings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn reconnect_throttle(&self) -> Duration {
        Duration::from_secs(self.reconnect_throttle_secs)
    }

    pub fn stuck_connecting(&self) -> Duration {
        Duration::from_secs(self.stuck_connecting_secs)
    }

    pub fn stuck_restart_delay(&self) -> Duration {
        Duration::from_secs(self.stuck_restart_delay_secs)
    }

    pub fn unreachable_retry(&self) -> Duration {
        Duration::from_secs(self.unreachable_retry_secs)
    }

    pub fn reachability_poll(&self) -> Duration {
        Duration::from_secs(self.reachability_poll_secs)
    }
}

impl Default for ReconcileTimings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 10,
            reconnect_throttle_secs: 5,
            stuck_connecting_secs: 5,
            stuck_restart_delay_secs: 1,
            unreachable_retry_secs: 5,
            reachability_poll_secs: 5,
        }
    }
}

/// Live reachability probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    /// URL fetched to prove the network actually works
    pub probe_url: String,
    /// Probe timeout
    pub probe_timeout_secs: u64,
}

impl ReachabilityConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            probe_url: "https://www.apple.com".to_string(),
            probe_timeout_secs: 5,
        }
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    /// Name identifying this product's tunnel configuration in the OS store
    pub vpn_name: String,
    /// Base domain; servers live at `<region>.<vpn_domain>`
    pub vpn_domain: String,
    /// IKEv2 remote identifier and server certificate issuer
    pub remote_identifier: String,
    /// Retries of a configure call that hit a stale-configuration error
    pub stale_config_retries: u32,
    /// Directory holding `settings.json` and `whitelist.json`
    pub data_dir: PathBuf,
    /// Local proxy endpoint
    pub proxy: ProxyEndpoint,
    /// Reconciliation timers
    pub timings: ReconcileTimings,
    /// Reachability probe
    pub reachability: ReachabilityConfig,
}

impl VpnConfig {
    /// Load from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Server address for a region code
    pub fn server_address(&self, region: &str) -> String {
        format!("{}.{}", region.to_lowercase(), self.vpn_domain)
    }

    /// Unroutable address used to ground the tunnel after a fatal auth failure
    pub fn grounded_address(&self) -> String {
        format!("local.{}", self.vpn_domain)
    }

    /// Path of the persisted controller settings
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    /// Path of the whitelist store shared with the tunnel extension
    pub fn whitelist_path(&self) -> PathBuf {
        self.data_dir.join("whitelist.json")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.vpn_name.is_empty() || self.vpn_domain.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        let t = &self.timings;
        if t.reconcile_interval_secs == 0
            || t.stuck_connecting_secs == 0
            || t.reachability_poll_secs == 0
        {
            return Err(ConfigError::ZeroInterval);
        }
        let probe = url::Url::parse(&self.reachability.probe_url)
            .map_err(|e| ConfigError::InvalidProbeUrl(e.to_string()))?;
        if !matches!(probe.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidProbeUrl(probe.scheme().to_string()));
        }
        Ok(())
    }
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            vpn_name: "Confirmed VPN".to_string(),
            vpn_domain: "confirmedvpn.com".to_string(),
            remote_identifier: "www.confirmedvpn.com".to_string(),
            stale_config_retries: 1,
            data_dir: default_data_dir(),
            proxy: ProxyEndpoint::default(),
            timings: ReconcileTimings::default(),
            reachability: ReachabilityConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) => PathBuf::from(dir).join("tunnels"),
        None => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".config").join("tunnels"),
            None => PathBuf::from(".tunnels"),
        },
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    Io(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid proxy port")]
    InvalidPort,

    #[error("VPN name and domain must be set")]
    MissingIdentity,

    #[error("Timer intervals must be non-zero")]
    ZeroInterval,

    #[error("Invalid reachability probe URL: {0}")]
    InvalidProbeUrl(String),
}
