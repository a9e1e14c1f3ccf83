//! strongSwan Backend
//!
//! Drives the system IKEv2 daemon through `swanctl`. The saved profile
//! lives as JSON next to the controller settings; every save re-renders
//! the swanctl connection file and reloads it.
//!
//! Saves are optimistic: if the profile file changed on disk since this
//! process last read it, the save reports a stale configuration and the
//! caller redoes the whole configure.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnels_vpn::{
    BackendError, DeadPeerDetection, EncryptionAlgorithm, IntegrityAlgorithm,
    SecurityAssociation, TunnelProfile, TunnelStatus, VpnBackend,
};

/// Connection name inside swanctl
const CONNECTION: &str = "tunnels";

/// Paths used by the backend
#[derive(Debug, Clone)]
pub struct SwanctlPaths {
    /// Saved profile (JSON)
    pub profile: PathBuf,
    /// Rendered connection file
    pub connection: PathBuf,
    /// Client certificate (PKCS#12)
    pub pkcs12: PathBuf,
}

impl SwanctlPaths {
    pub fn new(data_dir: &Path, swanctl_dir: &Path) -> Self {
        Self {
            profile: data_dir.join("tunnel-profile.json"),
            connection: swanctl_dir.join("conf.d").join(format!("{}.conf", CONNECTION)),
            pkcs12: swanctl_dir.join("pkcs12").join(format!("{}.p12", CONNECTION)),
        }
    }
}

struct SwanState {
    /// mtime of the profile file when last read or written by us
    seen: Option<SystemTime>,
    status: TunnelStatus,
}

/// `swanctl`-driven VPN backend
pub struct SwanctlBackend {
    paths: SwanctlPaths,
    state: Mutex<SwanState>,
    events: broadcast::Sender<TunnelStatus>,
}

impl SwanctlBackend {
    pub fn new(paths: SwanctlPaths) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            paths,
            state: Mutex::new(SwanState {
                seen: None,
                status: TunnelStatus::Disconnected,
            }),
            events,
        }
    }

    /// Poll SA state and broadcast changes
    pub fn spawn_monitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let backend = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match backend.query_status().await {
                    Ok(status) => backend.set_status(status).await,
                    Err(e) => debug!("swanctl status query failed: {}", e),
                }
            }
        })
    }

    async fn set_status(&self, status: TunnelStatus) {
        let mut state = self.state.lock().await;
        if state.status != status {
            info!("Tunnel status {} -> {}", state.status, status);
            state.status = status;
            let _ = self.events.send(status);
        }
    }

    async fn query_status(&self) -> Result<TunnelStatus, BackendError> {
        let output = swanctl(&["--list-sas", "--ike", CONNECTION]).await?;
        Ok(parse_sa_state(&output))
    }

    fn mtime(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}

#[async_trait]
impl VpnBackend for SwanctlBackend {
    async fn load(&self) -> Result<Option<TunnelProfile>, BackendError> {
        let mut state = self.state.lock().await;
        let content = match tokio::fs::read(&self.paths.profile).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                state.seen = None;
                return Ok(None);
            }
            Err(e) => return Err(BackendError::Io(e.to_string())),
        };
        state.seen = Self::mtime(&self.paths.profile);
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| BackendError::Io(e.to_string()))
    }

    async fn save(&self, profile: &TunnelProfile) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let on_disk = Self::mtime(&self.paths.profile);
        if on_disk != state.seen {
            state.seen = on_disk;
            return Err(BackendError::StaleConfiguration);
        }

        let json = serde_json::to_vec_pretty(profile).map_err(|e| BackendError::Io(e.to_string()))?;
        write_file(&self.paths.profile, &json).await?;
        write_file(&self.paths.connection, render_connection(profile).as_bytes()).await?;
        if let Some(identity) = &profile.identity {
            write_file(&self.paths.pkcs12, identity.certificate()).await?;
        }
        state.seen = Self::mtime(&self.paths.profile);
        drop(state);

        swanctl(&["--load-all", "--noprompt"]).await?;
        debug!("swanctl configuration reloaded");
        Ok(())
    }

    async fn start_tunnel(&self) -> Result<(), BackendError> {
        match self.load().await? {
            None => return Err(BackendError::NotConfigured),
            Some(profile) if !profile.enabled => return Err(BackendError::Disabled),
            Some(_) => {}
        }

        // --initiate blocks until the SA is up; let it run in the background
        let mut child = Command::new("swanctl")
            .args(["--initiate", "--child", CONNECTION])
            .spawn()
            .map_err(|e| BackendError::Command(e.to_string()))?;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => warn!("swanctl --initiate exited with {}", status),
                Ok(_) => {}
                Err(e) => warn!("swanctl --initiate failed: {}", e),
            }
        });

        self.set_status(TunnelStatus::Connecting).await;
        Ok(())
    }

    async fn stop_tunnel(&self) -> Result<(), BackendError> {
        self.set_status(TunnelStatus::Disconnecting).await;
        let result = swanctl(&["--terminate", "--ike", CONNECTION]).await;
        self.set_status(TunnelStatus::Disconnected).await;
        result.map(|_| ())
    }

    async fn status(&self) -> TunnelStatus {
        self.state.lock().await.status
    }

    fn subscribe(&self) -> broadcast::Receiver<TunnelStatus> {
        self.events.subscribe()
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| BackendError::Io(format!("{}: {}", path.display(), e)))
}

async fn swanctl(args: &[&str]) -> Result<String, BackendError> {
    let output = Command::new("swanctl")
        .args(args)
        .output()
        .await
        .map_err(|e| BackendError::Command(e.to_string()))?;
    if !output.status.success() {
        return Err(BackendError::Command(format!(
            "swanctl {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Map `swanctl --list-sas` output to a tunnel status
fn parse_sa_state(output: &str) -> TunnelStatus {
    let ike_line = output
        .lines()
        .find(|line| line.trim_start().starts_with(&format!("{}:", CONNECTION)));
    match ike_line {
        Some(line) if line.contains("ESTABLISHED") => TunnelStatus::Connected,
        Some(line) if line.contains("CONNECTING") => TunnelStatus::Connecting,
        Some(line) if line.contains("DELETING") => TunnelStatus::Disconnecting,
        _ => TunnelStatus::Disconnected,
    }
}

fn proposal(sa: &SecurityAssociation, with_prf: bool) -> String {
    let cipher = match sa.encryption {
        EncryptionAlgorithm::Aes128Gcm => "aes128gcm16",
        EncryptionAlgorithm::Aes256Gcm => "aes256gcm16",
    };
    let prf = match sa.integrity {
        IntegrityAlgorithm::Sha256 => "prfsha256",
        IntegrityAlgorithm::Sha512 => "prfsha512",
    };
    let group = match sa.dh_group {
        19 => "ecp256".to_string(),
        20 => "ecp384".to_string(),
        other => format!("modp{}", other),
    };
    if with_prf {
        format!("{}-{}-{}", cipher, prf, group)
    } else {
        format!("{}-{}", cipher, group)
    }
}

/// Render the swanctl.conf connection block for a profile
fn render_connection(profile: &TunnelProfile) -> String {
    let dpd = match profile.dead_peer_detection {
        DeadPeerDetection::None => String::new(),
        other => format!("        dpd_delay = {}s\n", other.interval_secs()),
    };
    let autostart = if profile.enabled && profile.on_demand_enabled {
        "trap"
    } else {
        "none"
    };

    format!(
        "# Managed by tunnels; changes are overwritten\n\
         connections {{\n\
         \x20   {name} {{\n\
         \x20       version = 2\n\
         \x20       remote_addrs = {server}\n\
         \x20       proposals = {ike}\n\
         \x20       rekey_time = {ike_life}m\n\
         {dpd}\
         \x20       local {{\n\
         \x20           auth = pubkey\n\
         \x20           id = {local_id}\n\
         \x20       }}\n\
         \x20       remote {{\n\
         \x20           auth = pubkey\n\
         \x20           id = {remote_id}\n\
         \x20       }}\n\
         \x20       children {{\n\
         \x20           {name} {{\n\
         \x20               remote_ts = 0.0.0.0/0\n\
         \x20               esp_proposals = {esp}\n\
         \x20               rekey_time = {child_life}m\n\
         \x20               start_action = {autostart}\n\
         \x20           }}\n\
         \x20       }}\n\
         \x20   }}\n\
         }}\n",
        name = CONNECTION,
        server = profile.server_address,
        ike = proposal(&profile.ike_sa, true),
        ike_life = profile.ike_sa.lifetime_minutes,
        dpd = dpd,
        local_id = profile.local_identifier,
        remote_id = profile.remote_identifier,
        esp = proposal(&profile.child_sa, false),
        child_life = profile.child_sa.lifetime_minutes,
        autostart = autostart,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnels_vpn::{ClientIdentity, OnDemandRule, VpnConfig};

    fn profile() -> TunnelProfile {
        let identity = ClientIdentity::new("client-1", vec![1, 2, 3]).unwrap();
        TunnelProfile::ikev2(
            &VpnConfig::default(),
            "us-west.confirmedvpn.com",
            &identity,
            vec![OnDemandRule::always_connect()],
        )
    }

    #[test]
    fn test_render_connection() {
        let conf = render_connection(&profile());

        assert!(conf.contains("remote_addrs = us-west.confirmedvpn.com"));
        assert!(conf.contains("proposals = aes128gcm16-prfsha512-ecp256"));
        assert!(conf.contains("esp_proposals = aes128gcm16-ecp256"));
        assert!(conf.contains("rekey_time = 1440m"));
        assert!(conf.contains("dpd_delay = 600s"));
        assert!(conf.contains("id = client-1"));
        assert!(conf.contains("id = www.confirmedvpn.com"));
        assert!(conf.contains("start_action = trap"));
    }

    #[test]
    fn test_grounded_profile_does_not_autostart() {
        let conf = render_connection(&TunnelProfile::grounded(&VpnConfig::default()));
        assert!(conf.contains("remote_addrs = local.confirmedvpn.com"));
        assert!(conf.contains("start_action = none"));
    }

    #[test]
    fn test_parse_sa_state() {
        let established = "tunnels: #3, ESTABLISHED, IKEv2, 1a2b3c_i* 4d5e6f_r\n  local  'client-1' @ 10.0.0.2[4500]\n";
        assert_eq!(parse_sa_state(established), TunnelStatus::Connected);
        assert_eq!(parse_sa_state("tunnels: #4, CONNECTING, IKEv2\n"), TunnelStatus::Connecting);
        assert_eq!(parse_sa_state(""), TunnelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_external_write_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SwanctlPaths::new(dir.path(), &dir.path().join("swanctl"));
        let backend = SwanctlBackend::new(paths.clone());

        assert!(backend.load().await.unwrap().is_none());

        // Another writer creates the profile behind our back
        std::fs::write(&paths.profile, serde_json::to_vec(&profile()).unwrap()).unwrap();

        assert_eq!(backend.save(&profile()).await, Err(BackendError::StaleConfiguration));
        assert!(backend.load().await.unwrap().is_some());
    }
}
