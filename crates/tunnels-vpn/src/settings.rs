//! Persisted Controller Settings
//!
//! The user's connect/disconnect intent must survive restarts: the OS
//! on-demand machinery is not trusted to bring the tunnel back, so the
//! controller re-derives everything from this file on launch.

use crate::whitelist::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// The user's last explicit intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Connected,
    #[default]
    Disconnected,
}

impl DesiredState {
    pub fn is_connected(&self) -> bool {
        matches!(self, DesiredState::Connected)
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Typed replacement for the loose key/value defaults store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Desired connection state
    pub desired_state: DesiredState,
    /// When the desired state last changed (wall clock)
    pub last_desired_change: Option<SystemTime>,
    /// Point the OS HTTP/HTTPS proxy at the local proxy while connected
    pub force_vpn_on: bool,
    /// One-shot: connect on next launch (set by updater relaunch)
    pub connect_on_launch: bool,
    /// Selected server region code
    pub region: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            desired_state: DesiredState::Disconnected,
            last_desired_change: None,
            force_vpn_on: false,
            connect_on_launch: false,
            region: crate::region::RegionId::default().code().to_string(),
        }
    }
}

impl ControllerSettings {
    /// Record a new desired state. Returns true if it changed.
    pub fn set_desired(&mut self, state: DesiredState) -> bool {
        let changed = self.desired_state != state;
        self.desired_state = state;
        self.last_desired_change = Some(SystemTime::now());
        changed
    }
}

/// JSON-file backed settings store
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings; a missing file yields defaults
    pub fn load(&self) -> Result<ControllerSettings, SettingsError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| SettingsError::Parse(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", self.path.display());
                Ok(ControllerSettings::default())
            }
            Err(e) => Err(SettingsError::Io(e.to_string())),
        }
    }

    /// Persist settings
    pub fn save(&self, settings: &ControllerSettings) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| SettingsError::Parse(e.to_string()))?;
        write_atomic(&self.path, json.as_bytes()).map_err(|e| SettingsError::Io(e.to_string()))
    }
}

/// Settings errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(String),

    #[error("Settings file is corrupt: {0}")]
    Parse(String),
}
