//! IKEv2 Tunnel Lifecycle
//!
//! Wraps the OS VPN manager behind [`VpnBackend`]. The manager never waits
//! for the tunnel to come up: `start`/`stop` hand the request to the OS and
//! return, and progress is observed through the status subscription.
//!
//! # Profile
//!
//! | Parameter | Value |
//! |-----------|-------|
//! | Authentication | certificate, ECDSA-256 |
//! | IKE / child SA cipher | AES-128-GCM |
//! | Integrity | SHA2-512 |
//! | DH group | 19 (ECP-256) |
//! | SA lifetime | 1440 minutes |
//! | Dead peer detection | medium |
//! | Redirect | disabled |
//! | Disconnect on sleep | no |
//! | HTTP/HTTPS proxy | 127.0.0.1:9090 |

use crate::compiler::OnDemandRule;
use crate::config::{ProxyEndpoint, VpnConfig};
use crate::identity::ClientIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Tunnel state as reported by the OS VPN stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// No usable configuration
    Invalid,
}

impl TunnelStatus {
    /// Connected or converging towards it
    pub fn is_up(&self) -> bool {
        matches!(self, TunnelStatus::Connected | TunnelStatus::Connecting)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelStatus::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, TunnelStatus::Connecting)
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Disconnecting => "disconnecting",
            TunnelStatus::Invalid => "invalid",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateType {
    Ecdsa256,
    Rsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityAlgorithm {
    Sha256,
    Sha512,
}

/// Dead peer detection rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadPeerDetection {
    None,
    Low,
    Medium,
    High,
}

impl DeadPeerDetection {
    /// Probe interval in seconds (0 disables)
    pub fn interval_secs(&self) -> u32 {
        match self {
            DeadPeerDetection::None => 0,
            DeadPeerDetection::Low => 30 * 60,
            DeadPeerDetection::Medium => 10 * 60,
            DeadPeerDetection::High => 60,
        }
    }
}

/// One security association proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAssociation {
    pub encryption: EncryptionAlgorithm,
    pub integrity: IntegrityAlgorithm,
    pub dh_group: u16,
    pub lifetime_minutes: u32,
}

impl Default for SecurityAssociation {
    fn default() -> Self {
        Self {
            encryption: EncryptionAlgorithm::Aes128Gcm,
            integrity: IntegrityAlgorithm::Sha512,
            dh_group: 19,
            lifetime_minutes: 1440,
        }
    }
}

/// Saved tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelProfile {
    /// Product identifier used by `is_installed`
    pub description: String,
    pub server_address: String,
    pub remote_identifier: String,
    pub local_identifier: String,
    /// Client certificate; absent on a grounded profile
    pub identity: Option<ClientIdentity>,
    pub certificate_type: CertificateType,
    pub ike_sa: SecurityAssociation,
    pub child_sa: SecurityAssociation,
    pub dead_peer_detection: DeadPeerDetection,
    pub disable_redirect: bool,
    pub disconnect_on_sleep: bool,
    /// HTTP and HTTPS proxy advertised with the tunnel
    pub proxy: Option<ProxyEndpoint>,
    pub on_demand_rules: Vec<OnDemandRule>,
    pub on_demand_enabled: bool,
    pub enabled: bool,
}

impl TunnelProfile {
    /// Full IKEv2 profile for `server_address`
    pub fn ikev2(
        config: &VpnConfig,
        server_address: impl Into<String>,
        identity: &ClientIdentity,
        rules: Vec<OnDemandRule>,
    ) -> Self {
        Self {
            description: config.vpn_name.clone(),
            server_address: server_address.into(),
            remote_identifier: config.remote_identifier.clone(),
            local_identifier: identity.local_identifier().to_string(),
            identity: Some(identity.clone()),
            certificate_type: CertificateType::Ecdsa256,
            ike_sa: SecurityAssociation::default(),
            child_sa: SecurityAssociation::default(),
            dead_peer_detection: DeadPeerDetection::Medium,
            disable_redirect: true,
            disconnect_on_sleep: false,
            proxy: Some(config.proxy),
            on_demand_rules: rules,
            on_demand_enabled: true,
            enabled: true,
        }
    }

    /// Disabled profile pointing at a non-routable server
    pub fn grounded(config: &VpnConfig) -> Self {
        Self {
            description: config.vpn_name.clone(),
            server_address: config.grounded_address(),
            remote_identifier: config.remote_identifier.clone(),
            local_identifier: String::new(),
            identity: None,
            certificate_type: CertificateType::Ecdsa256,
            ike_sa: SecurityAssociation::default(),
            child_sa: SecurityAssociation::default(),
            dead_peer_detection: DeadPeerDetection::Medium,
            disable_redirect: true,
            disconnect_on_sleep: false,
            proxy: None,
            on_demand_rules: Vec::new(),
            on_demand_enabled: false,
            enabled: false,
        }
    }

    /// Does this profile belong to this product and is it active?
    pub fn is_installed_for(&self, config: &VpnConfig) -> bool {
        self.description == config.vpn_name && self.enabled
    }
}

/// OS VPN manager
#[async_trait]
pub trait VpnBackend: Send + Sync {
    /// Load the saved profile, if any
    async fn load(&self) -> Result<Option<TunnelProfile>, BackendError>;

    /// Save a profile, replacing the current one
    async fn save(&self, profile: &TunnelProfile) -> Result<(), BackendError>;

    /// Ask the OS to bring the tunnel up. Returns once the request is accepted.
    async fn start_tunnel(&self) -> Result<(), BackendError>;

    /// Ask the OS to take the tunnel down
    async fn stop_tunnel(&self) -> Result<(), BackendError>;

    /// Current tunnel status
    async fn status(&self) -> TunnelStatus;

    /// Status-change notifications
    fn subscribe(&self) -> broadcast::Receiver<TunnelStatus>;
}

/// Tunnel lifecycle manager
#[derive(Clone)]
pub struct TunnelManager {
    backend: Arc<dyn VpnBackend>,
    config: Arc<VpnConfig>,
}

impl TunnelManager {
    pub fn new(backend: Arc<dyn VpnBackend>, config: Arc<VpnConfig>) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<dyn VpnBackend> {
        &self.backend
    }

    /// Persist the tunnel profile. A stale-configuration error means another
    /// writer got there first; the whole configure is redone.
    pub async fn configure(
        &self,
        server_address: &str,
        identity: &ClientIdentity,
        rules: Vec<OnDemandRule>,
    ) -> Result<(), TunnelError> {
        let retries = self.config.stale_config_retries;
        let mut attempt = 0;

        loop {
            match self.try_configure(server_address, identity, rules.clone()).await {
                Ok(()) => {
                    info!("Tunnel configured for {}", server_address);
                    return Ok(());
                }
                Err(BackendError::StaleConfiguration) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "Tunnel configuration is stale, retrying ({}/{})",
                        attempt, retries
                    );
                }
                Err(BackendError::StaleConfiguration) => {
                    error!(
                        "Tunnel configuration still stale after {} retries",
                        retries
                    );
                    return Err(TunnelError::ConfigurationContention(retries));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn try_configure(
        &self,
        server_address: &str,
        identity: &ClientIdentity,
        rules: Vec<OnDemandRule>,
    ) -> Result<(), BackendError> {
        if let Some(current) = self.backend.load().await? {
            debug!("Replacing tunnel profile for {}", current.server_address);
        }
        let profile = TunnelProfile::ikev2(&self.config, server_address, identity, rules);
        self.backend.save(&profile).await?;
        self.backend.load().await.map(|_| ())
    }

    /// Request tunnel start
    pub async fn start(&self) -> Result<(), TunnelError> {
        info!("Starting tunnel");
        self.backend.start_tunnel().await.map_err(TunnelError::StartFailed)
    }

    /// Request tunnel stop
    pub async fn stop(&self) -> Result<(), TunnelError> {
        info!("Stopping tunnel");
        self.backend.stop_tunnel().await.map_err(TunnelError::Backend)
    }

    pub async fn status(&self) -> TunnelStatus {
        self.backend.status().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelStatus> {
        self.backend.subscribe()
    }

    /// Is a profile for this product saved and enabled?
    pub async fn is_installed(&self) -> Result<bool, TunnelError> {
        let profile = self.backend.load().await?;
        Ok(profile.is_some_and(|p| p.is_installed_for(&self.config)))
    }

    /// Ground the tunnel after a fatal identity failure
    pub async fn force_off(&self) -> Result<(), TunnelError> {
        warn!("Forcing tunnel off, server set to {}", self.config.grounded_address());
        self.backend.save(&TunnelProfile::grounded(&self.config)).await?;
        self.backend.stop_tunnel().await?;
        Ok(())
    }
}

/// Errors reported by the OS VPN stack
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Configuration was changed by another writer")]
    StaleConfiguration,

    #[error("No tunnel configuration saved")]
    NotConfigured,

    #[error("Tunnel configuration is disabled")]
    Disabled,

    #[error("Backend command failed: {0}")]
    Command(String),

    #[error("Backend I/O error: {0}")]
    Io(String),
}

/// Tunnel errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    #[error("Configuration store contention after {0} retries")]
    ConfigurationContention(u32),

    #[error("Tunnel start failed: {0}")]
    StartFailed(BackendError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::compiler::OnDemandRule;

    fn identity() -> ClientIdentity {
        ClientIdentity::new("client-1", vec![1, 2, 3]).unwrap()
    }

    fn manager(backend: Arc<MemoryBackend>, retries: u32) -> TunnelManager {
        let config = VpnConfig {
            stale_config_retries: retries,
            ..VpnConfig::default()
        };
        TunnelManager::new(backend, Arc::new(config))
    }

    #[test]
    fn test_status_predicates() {
        assert!(TunnelStatus::Connected.is_up());
        assert!(TunnelStatus::Connecting.is_up());
        assert!(!TunnelStatus::Disconnecting.is_up());
        assert!(!TunnelStatus::Invalid.is_up());
        assert_eq!(TunnelStatus::default(), TunnelStatus::Disconnected);
    }

    #[test]
    fn test_ikev2_profile_parameters() {
        let config = VpnConfig::default();
        let profile = TunnelProfile::ikev2(
            &config,
            "us-west.confirmedvpn.com",
            &identity(),
            vec![OnDemandRule::always_connect()],
        );

        assert_eq!(profile.description, "Confirmed VPN");
        assert_eq!(profile.ike_sa.dh_group, 19);
        assert_eq!(profile.child_sa.lifetime_minutes, 1440);
        assert_eq!(profile.ike_sa.encryption, EncryptionAlgorithm::Aes128Gcm);
        assert_eq!(profile.ike_sa.integrity, IntegrityAlgorithm::Sha512);
        assert_eq!(profile.dead_peer_detection, DeadPeerDetection::Medium);
        assert_eq!(profile.proxy.unwrap().to_string(), "127.0.0.1:9090");
        assert!(profile.disable_redirect);
        assert!(!profile.disconnect_on_sleep);
        assert!(profile.is_installed_for(&config));
    }

    #[test]
    fn test_grounded_profile() {
        let config = VpnConfig::default();
        let profile = TunnelProfile::grounded(&config);

        assert_eq!(profile.server_address, "local.confirmedvpn.com");
        assert!(!profile.enabled);
        assert!(!profile.on_demand_enabled);
        assert!(!profile.is_installed_for(&config));
    }

    #[tokio::test]
    async fn test_configure_retries_stale_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.inject_stale_errors(1).await;
        let tunnels = manager(backend.clone(), 1);

        tunnels
            .configure("us-west.confirmedvpn.com", &identity(), vec![])
            .await
            .unwrap();

        assert_eq!(backend.counters().saves(), 2);
        assert!(tunnels.is_installed().await.unwrap());
    }

    #[tokio::test]
    async fn test_configure_contention_exhausted() {
        let backend = Arc::new(MemoryBackend::new());
        backend.inject_stale_errors(5).await;
        let tunnels = manager(backend.clone(), 1);

        let err = tunnels
            .configure("us-west.confirmedvpn.com", &identity(), vec![])
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::ConfigurationContention(1)));
        assert!(!tunnels.is_installed().await.unwrap());
    }

    #[tokio::test]
    async fn test_force_off() {
        let backend = Arc::new(MemoryBackend::new());
        let tunnels = manager(backend.clone(), 1);
        tunnels
            .configure("us-west.confirmedvpn.com", &identity(), vec![])
            .await
            .unwrap();

        tunnels.force_off().await.unwrap();

        let profile = backend.profile().await.unwrap();
        assert_eq!(profile.server_address, "local.confirmedvpn.com");
        assert!(!tunnels.is_installed().await.unwrap());
        assert_eq!(tunnels.status().await, TunnelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_start_without_profile_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let tunnels = manager(backend, 1);

        let err = tunnels.start().await.unwrap_err();
        assert!(matches!(err, TunnelError::StartFailed(BackendError::NotConfigured)));
    }
}
