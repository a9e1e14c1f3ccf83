//! Domain Whitelist
//!
//! Domains that bypass the tunnel. Two independent mappings are kept:
//!
//! - **Confirmed**: curated list shipped with the app; users may only
//!   toggle entries on or off.
//! - **User**: domains the user typed in; added and removed freely.
//!
//! The store is a JSON file in the shared data directory so the tunnel
//! extension reads exactly what the controller wrote.
//!
//! Domains are validated as hostnames before they are stored. The PAC
//! script embeds them verbatim, so anything outside `[a-z0-9-.]` (plus
//! a leading `*.`) is refused.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Which mapping an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhitelistSource {
    /// Curated list
    Confirmed,
    /// User-added list
    User,
}

impl std::fmt::Display for WhitelistSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmed => write!(f, "confirmed"),
            Self::User => write!(f, "user"),
        }
    }
}

/// One whitelist row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistEntry {
    pub domain: String,
    pub enabled: bool,
    pub source: WhitelistSource,
}

/// Curated defaults seeded on first run
pub const CONFIRMED_DEFAULTS: &[&str] = &[
    "apple.com",
    "icloud.com",
    "netflix.com",
    "hulu.com",
    "skype.com",
    "southwest.com",
    "hbonow.com",
    "spotify.com",
    "zoom.us",
];

/// Snapshot of both mappings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Whitelist {
    /// Curated list: domain -> enabled
    pub confirmed: BTreeMap<String, bool>,
    /// User list: domain -> enabled
    pub user: BTreeMap<String, bool>,
}

impl Whitelist {
    /// Empty whitelist
    pub fn new() -> Self {
        Self::default()
    }

    /// Whitelist with the curated defaults enabled
    pub fn with_confirmed_defaults() -> Self {
        let mut list = Self::new();
        list.seed_confirmed_defaults();
        list
    }

    /// Add curated defaults that are not present yet. Existing toggles are kept.
    pub fn seed_confirmed_defaults(&mut self) -> usize {
        let mut added = 0;
        for domain in CONFIRMED_DEFAULTS {
            if !self.confirmed.contains_key(*domain) {
                self.confirmed.insert((*domain).to_string(), true);
                added += 1;
            }
        }
        added
    }

    fn map(&self, source: WhitelistSource) -> &BTreeMap<String, bool> {
        match source {
            WhitelistSource::Confirmed => &self.confirmed,
            WhitelistSource::User => &self.user,
        }
    }

    fn map_mut(&mut self, source: WhitelistSource) -> &mut BTreeMap<String, bool> {
        match source {
            WhitelistSource::Confirmed => &mut self.confirmed,
            WhitelistSource::User => &mut self.user,
        }
    }

    /// Add a user domain (enabled). Returns false if it was already present.
    pub fn add_user_domain(&mut self, domain: &str) -> Result<bool, WhitelistError> {
        let domain = validate_domain(domain)?;
        let previous = self.user.insert(domain, true);
        Ok(previous != Some(true))
    }

    /// Remove a user domain. Returns false if it was not present.
    pub fn remove_user_domain(&mut self, domain: &str) -> bool {
        let key = domain.trim().to_ascii_lowercase();
        self.user.remove(&key).is_some()
    }

    /// Enable or disable an existing entry
    pub fn toggle(&mut self, source: WhitelistSource, domain: &str, enabled: bool) -> Result<(), WhitelistError> {
        let key = domain.trim().to_ascii_lowercase();
        match self.map_mut(source).get_mut(&key) {
            Some(value) => {
                *value = enabled;
                Ok(())
            }
            None => Err(WhitelistError::UnknownDomain(source, key)),
        }
    }

    /// Is the domain present and enabled in the given mapping?
    pub fn is_enabled(&self, source: WhitelistSource, domain: &str) -> bool {
        self.map(source)
            .get(&domain.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(false)
    }

    /// All entries of both mappings
    pub fn entries(&self) -> Vec<WhitelistEntry> {
        let confirmed = self.confirmed.iter().map(|(d, e)| WhitelistEntry {
            domain: d.clone(),
            enabled: *e,
            source: WhitelistSource::Confirmed,
        });
        let user = self.user.iter().map(|(d, e)| WhitelistEntry {
            domain: d.clone(),
            enabled: *e,
            source: WhitelistSource::User,
        });
        confirmed.chain(user).collect()
    }

    /// Enabled domains of both mappings, as stored (not normalized)
    pub fn enabled_domains(&self) -> impl Iterator<Item = &str> {
        self.confirmed
            .iter()
            .chain(self.user.iter())
            .filter(|(_, enabled)| **enabled)
            .map(|(domain, _)| domain.as_str())
    }

    /// Total number of entries
    pub fn len(&self) -> usize {
        self.confirmed.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validate and canonicalize a hostname pattern.
///
/// Accepts an optional leading `*.` and dot-separated labels of ASCII
/// letters, digits and hyphens (1-63 chars, no leading or trailing
/// hyphen), 253 chars total. Returns the lowercased form.
pub fn validate_domain(domain: &str) -> Result<String, WhitelistError> {
    let lowered = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid = || WhitelistError::InvalidDomain(domain.to_string());

    let body = lowered.strip_prefix("*.").unwrap_or(&lowered);
    if body.is_empty() || body.len() > 253 {
        return Err(invalid());
    }

    for label in body.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid());
        }
    }

    Ok(lowered)
}

/// JSON-file backed whitelist store
#[derive(Debug, Clone)]
pub struct WhitelistStore {
    path: PathBuf,
}

impl WhitelistStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whitelist. A missing file is an empty whitelist.
    pub fn load(&self) -> Result<Whitelist, WhitelistError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| WhitelistError::Parse(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No whitelist at {}, using empty list", self.path.display());
                Ok(Whitelist::new())
            }
            Err(e) => Err(WhitelistError::Io(e.to_string())),
        }
    }

    /// Persist the whitelist (write to temp file, then rename)
    pub fn save(&self, list: &Whitelist) -> Result<(), WhitelistError> {
        let json = serde_json::to_string_pretty(list)
            .map_err(|e| WhitelistError::Parse(e.to_string()))?;
        write_atomic(&self.path, json.as_bytes()).map_err(|e| WhitelistError::Io(e.to_string()))
    }

    /// Seed curated defaults on first run
    pub fn ensure_defaults(&self) -> Result<Whitelist, WhitelistError> {
        let mut list = self.load()?;
        let added = list.seed_confirmed_defaults();
        if added > 0 {
            info!("Seeded {} curated whitelist domains", added);
            self.save(&list)?;
        }
        Ok(list)
    }

    /// Load, apply a mutation, save. Returns the new snapshot.
    pub fn update<F>(&self, mutate: F) -> Result<Whitelist, WhitelistError>
    where
        F: FnOnce(&mut Whitelist) -> Result<(), WhitelistError>,
    {
        let mut list = self.load()?;
        mutate(&mut list)?;
        self.save(&list)?;
        Ok(list)
    }
}

/// Write a file atomically: temp file in the same directory, then rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Whitelist errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum WhitelistError {
    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("Domain {1} is not in the {0} whitelist")]
    UnknownDomain(WhitelistSource, String),

    #[error("Whitelist store I/O error: {0}")]
    Io(String),

    #[error("Whitelist store is corrupt: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_domain() {
        assert_eq!(validate_domain("Example.COM").unwrap(), "example.com");
        assert_eq!(validate_domain("*.example.com").unwrap(), "*.example.com");
        assert_eq!(validate_domain("localhost").unwrap(), "localhost");
        assert_eq!(validate_domain("example.com.").unwrap(), "example.com");
        assert_eq!(validate_domain("xn--bcher-kva.de").unwrap(), "xn--bcher-kva.de");
    }

    #[test]
    fn test_validate_rejects_script_syntax() {
        for bad in [
            "",
            "*.",
            "a..b",
            "-lead.com",
            "trail-.com",
            "exa mple.com",
            "evil.com\") return \"DIRECT\"; //",
            "x.com || true",
            "*.*.example.com",
            "ex*ample.com",
        ] {
            assert!(validate_domain(bad).is_err(), "accepted {:?}", bad);
        }
        let long_label = format!("{}.com", "a".repeat(64));
        assert!(validate_domain(&long_label).is_err());
    }

    #[test]
    fn test_add_remove_user_domain() {
        let mut list = Whitelist::new();

        assert!(list.add_user_domain("Example.com").unwrap());
        assert!(!list.add_user_domain("example.com").unwrap());
        assert!(list.is_enabled(WhitelistSource::User, "example.com"));

        assert!(list.remove_user_domain("EXAMPLE.com"));
        assert!(!list.remove_user_domain("example.com"));
        assert!(list.is_empty());
    }

    #[test]
    fn test_toggle_confirmed() {
        let mut list = Whitelist::with_confirmed_defaults();
        assert!(list.is_enabled(WhitelistSource::Confirmed, "netflix.com"));

        list.toggle(WhitelistSource::Confirmed, "netflix.com", false).unwrap();
        assert!(!list.is_enabled(WhitelistSource::Confirmed, "netflix.com"));

        let err = list.toggle(WhitelistSource::User, "netflix.com", true).unwrap_err();
        assert!(matches!(err, WhitelistError::UnknownDomain(WhitelistSource::User, _)));
    }

    #[test]
    fn test_seed_keeps_existing_toggles() {
        let mut list = Whitelist::new();
        list.confirmed.insert("netflix.com".into(), false);

        let added = list.seed_confirmed_defaults();

        assert_eq!(added, CONFIRMED_DEFAULTS.len() - 1);
        assert!(!list.is_enabled(WhitelistSource::Confirmed, "netflix.com"));
    }

    #[test]
    fn test_enabled_domains_skip_disabled() {
        let mut list = Whitelist::new();
        list.confirmed.insert("a.com".into(), true);
        list.confirmed.insert("b.com".into(), false);
        list.user.insert("c.com".into(), true);

        let enabled: Vec<&str> = list.enabled_domains().collect();
        assert_eq!(enabled, vec!["a.com", "c.com"]);
        assert_eq!(list.entries().len(), 3);
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = WhitelistStore::new(dir.path().join("nested").join("whitelist.json"));

        assert!(store.load().unwrap().is_empty());

        let list = store
            .update(|list| list.add_user_domain("example.com").map(|_| ()))
            .unwrap();
        assert_eq!(store.load().unwrap(), list);
    }

    #[test]
    fn test_store_ensure_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = WhitelistStore::new(dir.path().join("whitelist.json"));

        store.ensure_defaults().unwrap();
        store
            .update(|list| list.toggle(WhitelistSource::Confirmed, "apple.com", false))
            .unwrap();
        let list = store.ensure_defaults().unwrap();

        assert!(!list.is_enabled(WhitelistSource::Confirmed, "apple.com"));
    }

    #[test]
    fn test_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whitelist.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = WhitelistStore::new(path).load();
        assert!(matches!(result, Err(WhitelistError::Parse(_))));
    }
}
