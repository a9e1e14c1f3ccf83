//! Require-VPN Kill Switch
//!
//! When "require VPN" (`force_vpn_on`) is set, the OS-wide HTTP and HTTPS
//! proxy settings point at the loopback proxy. Traffic that is not
//! whitelisted then has nowhere to go except the tunnel.
//!
//! # Behavior
//!
//! | force_vpn_on | reachable | desired | system proxy |
//! |--------------|-----------|---------|--------------|
//! | false | any | any | cleared |
//! | true | false | any | cleared |
//! | true | true | disconnected | cleared |
//! | true | true | connected | installed |
//!
//! An unreachable network always clears the proxy: a proxy pointing at a
//! dead network leaves the user with no connectivity at all.

use crate::config::ProxyEndpoint;
use crate::settings::DesiredState;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Kill timeout for `networksetup` invocations
pub const NETWORKSETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// What the OS proxy settings should look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemProxyState {
    /// OS HTTP/HTTPS proxy disabled
    Cleared,
    /// OS HTTP/HTTPS proxy pointed at the loopback proxy
    Installed,
}

impl SystemProxyState {
    /// Decide the system proxy state for the current conditions
    pub fn decide(force_vpn_on: bool, reachable: bool, desired: DesiredState) -> Self {
        if force_vpn_on && reachable && desired.is_connected() {
            SystemProxyState::Installed
        } else {
            SystemProxyState::Cleared
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, SystemProxyState::Installed)
    }
}

/// OS-wide proxy settings
#[async_trait]
pub trait SystemProxy: Send + Sync {
    /// Point HTTP and HTTPS proxy settings at `endpoint`
    async fn install(&self, endpoint: &ProxyEndpoint) -> Result<(), SystemProxyError>;

    /// Disable HTTP and HTTPS proxy settings
    async fn clear(&self) -> Result<(), SystemProxyError>;
}

/// No-op system proxy, for the extension path and platforms without
/// `networksetup`
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSystemProxy;

#[async_trait]
impl SystemProxy for NoSystemProxy {
    async fn install(&self, _endpoint: &ProxyEndpoint) -> Result<(), SystemProxyError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), SystemProxyError> {
        Ok(())
    }
}

/// `networksetup`-driven proxy settings for one network service
#[derive(Debug, Clone)]
pub struct NetworkSetupProxy {
    /// Network service name (e.g. `Wi-Fi`)
    service: String,
    /// Per-command kill timeout
    timeout: Duration,
    /// Commands run one at a time
    queue: Arc<Mutex<()>>,
}

impl NetworkSetupProxy {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            timeout: NETWORKSETUP_TIMEOUT,
            queue: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[String]) -> Result<(), SystemProxyError> {
        let _serial = self.queue.lock().await;
        debug!("networksetup {}", args.join(" "));

        let child = Command::new("networksetup")
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| SystemProxyError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| SystemProxyError::Spawn(e.to_string()))?;

        if !output.status.success() {
            return Err(SystemProxyError::CommandFailed(
                args.first().cloned().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for NetworkSetupProxy {
    fn default() -> Self {
        Self::new("Wi-Fi")
    }
}

#[async_trait]
impl SystemProxy for NetworkSetupProxy {
    async fn install(&self, endpoint: &ProxyEndpoint) -> Result<(), SystemProxyError> {
        let host = endpoint.host.to_string();
        let port = endpoint.port.to_string();
        for flag in ["-setwebproxy", "-setsecurewebproxy"] {
            self.run(&[flag.into(), self.service.clone(), host.clone(), port.clone()])
                .await?;
        }
        for flag in ["-setwebproxystate", "-setsecurewebproxystate"] {
            self.run(&[flag.into(), self.service.clone(), "on".into()]).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), SystemProxyError> {
        for flag in ["-setwebproxystate", "-setsecurewebproxystate"] {
            self.run(&[flag.into(), self.service.clone(), "off".into()]).await?;
        }
        Ok(())
    }
}

/// Kill switch controller
///
/// Holds the require-VPN preference and applies the decided
/// `SystemProxyState`, touching the OS only when the state changes.
pub struct KillSwitch {
    /// Is require-VPN enabled?
    enabled: AtomicBool,
    /// Last applied state (None until first apply)
    applied: Mutex<Option<SystemProxyState>>,
    endpoint: ProxyEndpoint,
    system: Arc<dyn SystemProxy>,
}

impl KillSwitch {
    /// Create a new kill switch
    pub fn new(enabled: bool, endpoint: ProxyEndpoint, system: Arc<dyn SystemProxy>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            applied: Mutex::new(None),
            endpoint,
            system,
        }
    }

    /// Kill switch that never touches the OS
    pub fn disabled() -> Self {
        Self::new(false, ProxyEndpoint::default(), Arc::new(NoSystemProxy))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Last state pushed to the OS
    pub async fn applied(&self) -> Option<SystemProxyState> {
        *self.applied.lock().await
    }

    /// Apply the decision for the current conditions
    pub async fn apply(&self, reachable: bool, desired: DesiredState) -> Result<SystemProxyState, SystemProxyError> {
        let wanted = SystemProxyState::decide(self.is_enabled(), reachable, desired);
        self.apply_state(wanted).await
    }

    /// Clear the OS proxy on shutdown unless require-VPN is on
    pub async fn release(&self) -> Result<(), SystemProxyError> {
        if self.is_enabled() {
            debug!("Require-VPN set, leaving system proxy in place");
            return Ok(());
        }
        self.apply_state(SystemProxyState::Cleared).await.map(|_| ())
    }

    async fn apply_state(&self, wanted: SystemProxyState) -> Result<SystemProxyState, SystemProxyError> {
        let mut applied = self.applied.lock().await;
        if *applied == Some(wanted) {
            return Ok(wanted);
        }

        let result = match wanted {
            SystemProxyState::Installed => {
                info!("Kill switch: routing system HTTP/HTTPS through {}", self.endpoint);
                self.system.install(&self.endpoint).await
            }
            SystemProxyState::Cleared => {
                info!("Kill switch: clearing system proxy");
                self.system.clear().await
            }
        };
        result.inspect_err(|e| warn!("Kill switch: failed to update system proxy: {}", e))?;

        *applied = Some(wanted);
        Ok(wanted)
    }
}

/// System proxy errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SystemProxyError {
    #[error("Failed to launch networksetup: {0}")]
    Spawn(String),

    #[error("networksetup {0} failed: {1}")]
    CommandFailed(String, String),

    #[error("networksetup timed out after {0}s")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingProxy {
        calls: StdMutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl SystemProxy for RecordingProxy {
        async fn install(&self, _endpoint: &ProxyEndpoint) -> Result<(), SystemProxyError> {
            self.calls.lock().unwrap().push("install");
            Ok(())
        }

        async fn clear(&self) -> Result<(), SystemProxyError> {
            self.calls.lock().unwrap().push("clear");
            Ok(())
        }
    }

    #[test]
    fn test_decide() {
        use DesiredState::*;
        assert_eq!(SystemProxyState::decide(false, true, Connected), SystemProxyState::Cleared);
        assert_eq!(SystemProxyState::decide(true, false, Connected), SystemProxyState::Cleared);
        assert_eq!(SystemProxyState::decide(true, true, Disconnected), SystemProxyState::Cleared);
        assert_eq!(SystemProxyState::decide(true, true, Connected), SystemProxyState::Installed);
    }

    #[tokio::test]
    async fn test_kill_switch_applies_changes_once() {
        let recorder = Arc::new(RecordingProxy::default());
        let ks = KillSwitch::new(true, ProxyEndpoint::default(), recorder.clone());

        ks.apply(true, DesiredState::Connected).await.unwrap();
        ks.apply(true, DesiredState::Connected).await.unwrap();
        ks.apply(false, DesiredState::Connected).await.unwrap();

        assert_eq!(*recorder.calls.lock().unwrap(), vec!["install", "clear"]);
        assert_eq!(ks.applied().await, Some(SystemProxyState::Cleared));
    }

    #[tokio::test]
    async fn test_kill_switch_disabled_clears() {
        let recorder = Arc::new(RecordingProxy::default());
        let ks = KillSwitch::new(false, ProxyEndpoint::default(), recorder.clone());

        let state = ks.apply(true, DesiredState::Connected).await.unwrap();
        assert_eq!(state, SystemProxyState::Cleared);
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["clear"]);
    }

    #[tokio::test]
    async fn test_release_respects_require_vpn() {
        let recorder = Arc::new(RecordingProxy::default());
        let ks = KillSwitch::new(true, ProxyEndpoint::default(), recorder.clone());
        ks.apply(true, DesiredState::Connected).await.unwrap();

        ks.release().await.unwrap();
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["install"]);

        ks.set_enabled(false);
        ks.release().await.unwrap();
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["install", "clear"]);
    }

    #[tokio::test]
    async fn test_no_system_proxy() {
        let ks = KillSwitch::disabled();
        assert!(!ks.is_enabled());
        ks.release().await.unwrap();
    }
}
