//! VPN Controller
//!
//! The one object a UI talks to. Wires the whitelist store, the compiler,
//! the tunnel and proxy lifecycles and the reconciliation loop together.
//!
//! # Usage
//!
//! ```rust,ignore
//! let vpn = VpnController::start(config, backend, reachability, system_proxy).await?;
//! vpn.install_identity("client-id", &certificate_b64).await?;
//!
//! vpn.connect().await?;
//! vpn.add_whitelist_domain("example.com").await?;
//!
//! let mut status = vpn.subscribe();
//! while status.changed().await.is_ok() {
//!     render(*status.borrow());
//! }
//!
//! vpn.quit().await?;
//! ```

use crate::compiler::CompiledWhitelist;
use crate::config::{ConfigError, VpnConfig};
use crate::identity::{ClientIdentity, IdentityError};
use crate::kill_switch::{KillSwitch, SystemProxy};
use crate::proxy::{ProxyError, ProxyLifecycle};
use crate::reachability::{watch_edges, ReachabilityGate};
use crate::reconcile::{
    ReconcileError, ReconcileHandle, Reconciler, ReconcilerParts, StatusEvent, Trigger,
};
use crate::region::{RegionError, RegionId};
use crate::settings::{DesiredState, SettingsError, SettingsStore};
use crate::tunnel::{TunnelError, TunnelManager, VpnBackend};
use crate::whitelist::{Whitelist, WhitelistError, WhitelistSource, WhitelistStore};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// VPN controller errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("No client identity installed")]
    NoIdentity,

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Whitelist error: {0}")]
    Whitelist(#[from] WhitelistError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// VPN Controller
///
/// - Persists desired state and hands it to the reconciliation loop
/// - Recompiles the whitelist and reconfigures the tunnel on every edit
/// - Grounds the tunnel on fatal identity failures
pub struct VpnController {
    config: Arc<VpnConfig>,
    tunnel: TunnelManager,
    proxy: Arc<ProxyLifecycle>,
    whitelist: WhitelistStore,
    identity: RwLock<Option<ClientIdentity>>,
    /// Held from whitelist or identity change until the tunnel profile is
    /// written, so saved rules always match the stored whitelist
    edits: Mutex<()>,
    reconcile: ReconcileHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VpnController {
    /// Build every component and start the reconciliation loop
    pub async fn start(
        config: VpnConfig,
        backend: Arc<dyn VpnBackend>,
        reachability: Arc<dyn ReachabilityGate>,
        system_proxy: Arc<dyn SystemProxy>,
    ) -> Result<Self, VpnError> {
        config.validate()?;
        let config = Arc::new(config);

        let whitelist = WhitelistStore::new(config.whitelist_path());
        whitelist.ensure_defaults()?;

        let tunnel = TunnelManager::new(backend, config.clone());
        let proxy = Arc::new(ProxyLifecycle::for_endpoint(&config.proxy));
        let kill_switch = Arc::new(KillSwitch::new(false, config.proxy, system_proxy));

        let (reconciler, handle) = Reconciler::new(ReconcilerParts {
            config: config.clone(),
            tunnel: tunnel.clone(),
            proxy: proxy.clone(),
            reachability: reachability.clone(),
            kill_switch,
            settings: SettingsStore::new(config.settings_path()),
        })?;

        let mut tasks = vec![reconciler.spawn()];

        let restored = handle.clone();
        tasks.push(tokio::spawn(watch_edges(
            reachability,
            config.timings.reachability_poll(),
            move || restored.trigger(Trigger::ReachabilityRestored),
        )));

        let controller = Self {
            config,
            tunnel,
            proxy,
            whitelist,
            identity: RwLock::new(None),
            edits: Mutex::new(()),
            reconcile: handle,
            tasks: Mutex::new(tasks),
        };

        let settings = controller.reconcile.settings().await?;
        if settings.connect_on_launch {
            info!("Connect-on-launch requested");
            controller
                .reconcile
                .update_settings(|s| s.connect_on_launch = false)
                .await?;
            controller.reconcile.set_desired_state(DesiredState::Connected).await?;
        }

        Ok(controller)
    }

    /// Configuration in use
    pub fn config(&self) -> &VpnConfig {
        &self.config
    }

    /// Validate and install the client identity handed over by the auth
    /// client. An invalid identity grounds the tunnel.
    pub async fn install_identity(&self, local_identifier: &str, certificate_b64: &str) -> Result<(), VpnError> {
        match ClientIdentity::from_base64(local_identifier, certificate_b64) {
            Ok(identity) => self.set_identity(identity).await,
            Err(e) => {
                error!("Client identity rejected: {}", e);
                self.force_off().await?;
                Err(e.into())
            }
        }
    }

    /// Install an already validated identity and write the tunnel profile
    pub async fn set_identity(&self, identity: ClientIdentity) -> Result<(), VpnError> {
        let _edit = self.edits.lock().await;
        info!("Installing client identity {}", identity.local_identifier());
        *self.identity.write().await = Some(identity);
        self.reconfigure(&self.whitelist.load()?).await?;
        Ok(())
    }

    /// User pressed connect
    pub async fn connect(&self) -> Result<(), VpnError> {
        let edit = self.edits.lock().await;
        if !self.tunnel.is_installed().await? && !self.reconfigure(&self.whitelist.load()?).await? {
            return Err(VpnError::NoIdentity);
        }
        drop(edit);
        self.reconcile.set_desired_state(DesiredState::Connected).await?;
        Ok(())
    }

    /// User pressed disconnect
    pub async fn disconnect(&self) -> Result<(), VpnError> {
        self.reconcile.set_desired_state(DesiredState::Disconnected).await?;
        Ok(())
    }

    /// Disconnect and stop everything
    pub async fn quit(&self) -> Result<(), VpnError> {
        self.disconnect().await?;
        self.shutdown().await
    }

    /// Fatal auth failure: desired disconnected, tunnel grounded
    pub async fn force_off(&self) -> Result<(), VpnError> {
        let _edit = self.edits.lock().await;
        warn!("Forcing VPN off");
        *self.identity.write().await = None;
        self.reconcile.set_desired_state(DesiredState::Disconnected).await?;
        self.tunnel.force_off().await?;
        Ok(())
    }

    /// Device woke from sleep
    pub fn wake(&self) {
        self.reconcile.trigger(Trigger::Wake);
    }

    /// Add a user whitelist domain
    pub async fn add_whitelist_domain(&self, domain: &str) -> Result<CompiledWhitelist, VpnError> {
        let _edit = self.edits.lock().await;
        let list = self.whitelist.update(|list| list.add_user_domain(domain).map(|_| ()))?;
        info!("Whitelisted {}", domain);
        self.apply_whitelist(&list).await
    }

    /// Remove a user whitelist domain
    pub async fn remove_whitelist_domain(&self, domain: &str) -> Result<CompiledWhitelist, VpnError> {
        let _edit = self.edits.lock().await;
        let list = self.whitelist.update(|list| {
            if !list.remove_user_domain(domain) {
                return Err(WhitelistError::UnknownDomain(WhitelistSource::User, domain.to_string()));
            }
            Ok(())
        })?;
        info!("Removed {} from whitelist", domain);
        self.apply_whitelist(&list).await
    }

    /// Enable or disable an entry in either list
    pub async fn toggle_whitelist_domain(
        &self,
        source: WhitelistSource,
        domain: &str,
        enabled: bool,
    ) -> Result<CompiledWhitelist, VpnError> {
        let _edit = self.edits.lock().await;
        let list = self.whitelist.update(|list| list.toggle(source, domain, enabled))?;
        info!("Whitelist {} {} set to {}", source, domain, enabled);
        self.apply_whitelist(&list).await
    }

    /// Current whitelist snapshot
    pub fn whitelist(&self) -> Result<Whitelist, VpnError> {
        Ok(self.whitelist.load()?)
    }

    /// Compile the current whitelist
    pub fn compiled_whitelist(&self) -> Result<CompiledWhitelist, VpnError> {
        Ok(CompiledWhitelist::compile(&self.whitelist.load()?, &self.config.proxy))
    }

    /// Switch server region
    pub async fn set_region(&self, region: RegionId) -> Result<(), VpnError> {
        let _edit = self.edits.lock().await;
        self.reconcile
            .update_settings(move |s| s.region = region.code().to_string())
            .await?;
        info!("Region set to {} ({})", region.name(), region);
        if self.reconfigure(&self.whitelist.load()?).await? {
            self.reconcile.reconnect().await?;
        }
        Ok(())
    }

    /// Selected region
    pub async fn region(&self) -> Result<RegionId, VpnError> {
        Ok(self.reconcile.settings().await?.region.parse()?)
    }

    /// Toggle require-VPN mode
    pub async fn set_force_vpn_on(&self, enabled: bool) -> Result<(), VpnError> {
        self.reconcile
            .update_settings(move |s| s.force_vpn_on = enabled)
            .await?;
        self.reconcile.trigger(Trigger::Tick);
        Ok(())
    }

    /// Is this product's tunnel profile saved and enabled?
    pub async fn is_installed(&self) -> Result<bool, VpnError> {
        Ok(self.tunnel.is_installed().await?)
    }

    /// Latest status
    pub fn status(&self) -> StatusEvent {
        self.reconcile.status()
    }

    /// Status changes
    pub fn subscribe(&self) -> watch::Receiver<StatusEvent> {
        self.reconcile.subscribe()
    }

    /// Handle to the reconciliation loop
    pub fn reconcile_handle(&self) -> &ReconcileHandle {
        &self.reconcile
    }

    /// Stop the loop, the watchers and the local proxy
    pub async fn shutdown(&self) -> Result<(), VpnError> {
        info!("Shutting down VPN controller");
        let result = self.reconcile.shutdown().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.proxy.stop().await;
        result.map_err(VpnError::from)
    }

    /// Recompile, rewrite the tunnel profile, cycle the tunnel
    async fn apply_whitelist(&self, list: &Whitelist) -> Result<CompiledWhitelist, VpnError> {
        let compiled = CompiledWhitelist::compile(list, &self.config.proxy);
        if self.reconfigure(list).await? {
            self.reconcile.reconnect().await?;
        }
        Ok(compiled)
    }

    /// Write the tunnel profile. Returns false when no identity is installed yet.
    async fn reconfigure(&self, list: &Whitelist) -> Result<bool, VpnError> {
        let identity = self.identity.read().await;
        let Some(identity) = identity.as_ref() else {
            debug!("No identity yet, tunnel profile not written");
            return Ok(false);
        };

        let region: RegionId = self.reconcile.settings().await?.region.parse()?;
        let compiled = CompiledWhitelist::compile(list, &self.config.proxy);
        self.tunnel
            .configure(&region.server_address(&self.config), identity, compiled.rules)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::compiler::OnDemandRule;
    use crate::kill_switch::NoSystemProxy;
    use crate::reachability::ManualReachability;
    use crate::tunnel::TunnelStatus;

    struct Harness {
        vpn: VpnController,
        backend: Arc<MemoryBackend>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VpnConfig {
            data_dir: dir.path().to_path_buf(),
            ..VpnConfig::default()
        };
        config.proxy.port = {
            let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };

        let backend = Arc::new(MemoryBackend::new());
        let vpn = VpnController::start(
            config,
            backend.clone(),
            Arc::new(ManualReachability::new(true)),
            Arc::new(NoSystemProxy),
        )
        .await
        .unwrap();

        Harness {
            vpn,
            backend,
            _dir: dir,
        }
    }

    const CERT_B64: &str = "AAECAwQFBgc=";

    #[tokio::test]
    async fn test_connect_requires_identity() {
        let h = harness().await;

        assert!(matches!(h.vpn.connect().await, Err(VpnError::NoIdentity)));
        assert!(!h.vpn.is_installed().await.unwrap());

        h.vpn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_install_identity_writes_profile() {
        let h = harness().await;
        h.vpn.install_identity("client-1", CERT_B64).await.unwrap();

        assert!(h.vpn.is_installed().await.unwrap());
        let profile = h.backend.profile().await.unwrap();
        assert_eq!(profile.server_address, "us-west.confirmedvpn.com");
        assert_eq!(profile.local_identifier, "client-1");

        h.vpn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_identity_forces_off() {
        let h = harness().await;
        h.vpn.install_identity("client-1", CERT_B64).await.unwrap();

        let err = h.vpn.install_identity("client-1", "%%%").await.unwrap_err();
        assert!(matches!(err, VpnError::Identity(IdentityError::InvalidBase64)));

        let profile = h.backend.profile().await.unwrap();
        assert_eq!(profile.server_address, "local.confirmedvpn.com");
        assert!(!profile.enabled);
        assert!(!h.vpn.status().desired.is_connected());

        h.vpn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_whitelist_edit_rewrites_rules() {
        let h = harness().await;
        h.vpn.install_identity("client-1", CERT_B64).await.unwrap();
        let saves = h.backend.counters().saves();

        let compiled = h.vpn.add_whitelist_domain("example.org").await.unwrap();
        assert!(compiled.domains.contains("*.example.org"));
        assert_eq!(h.backend.counters().saves(), saves + 1);

        let profile = h.backend.profile().await.unwrap();
        match &profile.on_demand_rules[0] {
            OnDemandRule::NeverConnect { domains } => {
                assert!(domains.contains(&"*.example.org".to_string()))
            }
            other => panic!("unexpected first rule {:?}", other),
        }

        let compiled = h.vpn.remove_whitelist_domain("example.org").await.unwrap();
        assert!(!compiled.domains.contains("*.example.org"));
        assert!(h.vpn.remove_whitelist_domain("example.org").await.is_err());

        h.vpn.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_edits_keep_profile_in_sync() {
        let h = harness().await;
        h.vpn.install_identity("client-1", CERT_B64).await.unwrap();
        let vpn = Arc::new(h.vpn);

        let domains: Vec<String> = (0..12).map(|i| format!("site{}.example", i)).collect();
        let mut edits = tokio::task::JoinSet::new();
        for domain in domains.clone() {
            let vpn = vpn.clone();
            edits.spawn(async move { vpn.add_whitelist_domain(&domain).await.map(|_| ()) });
        }
        while let Some(result) = edits.join_next().await {
            result.unwrap().unwrap();
        }

        let expected = vpn.compiled_whitelist().unwrap();
        for domain in &domains {
            assert!(expected.domains.contains(&format!("*.{}", domain)));
        }
        let profile = h.backend.profile().await.unwrap();
        assert_eq!(profile.on_demand_rules, expected.rules);

        vpn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_domain_rejected() {
        let h = harness().await;

        let err = h.vpn.add_whitelist_domain("bad\"domain").await.unwrap_err();
        assert!(matches!(err, VpnError::Whitelist(WhitelistError::InvalidDomain(_))));

        h.vpn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_region() {
        let h = harness().await;
        h.vpn.install_identity("client-1", CERT_B64).await.unwrap();

        h.vpn.set_region(RegionId::EuLondon).await.unwrap();

        assert_eq!(h.vpn.region().await.unwrap(), RegionId::EuLondon);
        let profile = h.backend.profile().await.unwrap();
        assert_eq!(profile.server_address, "eu-london.confirmedvpn.com");

        h.vpn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let h = harness().await;
        h.vpn.install_identity("client-1", CERT_B64).await.unwrap();
        let mut status = h.vpn.subscribe();

        h.vpn.connect().await.unwrap();
        status
            .wait_for(|event| event.tunnel == TunnelStatus::Connected)
            .await
            .unwrap();
        assert!(h.vpn.status().proxy_active);

        h.vpn.disconnect().await.unwrap();
        status
            .wait_for(|event| event.tunnel == TunnelStatus::Disconnected && !event.proxy_active)
            .await
            .unwrap();

        h.vpn.quit().await.unwrap();
    }
}
