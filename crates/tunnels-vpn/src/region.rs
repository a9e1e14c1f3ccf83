//! Server Regions
//!
//! Each region is a separate IKEv2 endpoint at `<code>.<vpn_domain>`.
//! Switching region rewrites the saved tunnel configuration, so it goes
//! through the same reconfigure + reconnect cycle as a whitelist edit.
//!
//! | Code | Location |
//! |------|----------|
//! | us-west | USA West |
//! | us-east | USA East |
//! | eu-london | United Kingdom |
//! | eu-ireland | Ireland |
//! | eu-frankfurt | Germany |
//! | canada | Canada |
//! | ap-tokyo | Japan |
//! | ap-sydney | Australia |
//! | ap-singapore | Singapore |

use crate::config::VpnConfig;
use serde::{Deserialize, Serialize};

/// Region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegionId {
    #[default]
    UsWest,
    UsEast,
    EuLondon,
    EuIreland,
    EuFrankfurt,
    Canada,
    ApTokyo,
    ApSydney,
    ApSingapore,
}

impl RegionId {
    /// Get all available regions
    pub fn all() -> &'static [RegionId] {
        &[
            RegionId::UsWest,
            RegionId::UsEast,
            RegionId::EuLondon,
            RegionId::EuIreland,
            RegionId::EuFrankfurt,
            RegionId::Canada,
            RegionId::ApTokyo,
            RegionId::ApSydney,
            RegionId::ApSingapore,
        ]
    }

    /// Get region display name
    pub fn name(&self) -> &'static str {
        match self {
            RegionId::UsWest => "United States - West",
            RegionId::UsEast => "United States - East",
            RegionId::EuLondon => "United Kingdom",
            RegionId::EuIreland => "Ireland",
            RegionId::EuFrankfurt => "Germany",
            RegionId::Canada => "Canada",
            RegionId::ApTokyo => "Japan",
            RegionId::ApSydney => "Australia",
            RegionId::ApSingapore => "Singapore",
        }
    }

    /// Host label used in the server address
    pub fn code(&self) -> &'static str {
        match self {
            RegionId::UsWest => "us-west",
            RegionId::UsEast => "us-east",
            RegionId::EuLondon => "eu-london",
            RegionId::EuIreland => "eu-ireland",
            RegionId::EuFrankfurt => "eu-frankfurt",
            RegionId::Canada => "canada",
            RegionId::ApTokyo => "ap-tokyo",
            RegionId::ApSydney => "ap-sydney",
            RegionId::ApSingapore => "ap-singapore",
        }
    }

    /// Server address for this region
    pub fn server_address(&self, config: &VpnConfig) -> String {
        config.server_address(self.code())
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for RegionId {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        RegionId::all()
            .iter()
            .copied()
            .find(|region| region.code() == wanted)
            .ok_or_else(|| RegionError::InvalidRegion(s.to_string()))
    }
}

/// Region errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("Invalid region: {0}")]
    InvalidRegion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_parse() {
        assert_eq!("eu-london".parse::<RegionId>(), Ok(RegionId::EuLondon));
        assert_eq!(" AP-Tokyo ".parse::<RegionId>(), Ok(RegionId::ApTokyo));
        assert!("mars".parse::<RegionId>().is_err());
    }

    #[test]
    fn test_codes_roundtrip() {
        for region in RegionId::all() {
            assert_eq!(region.code().parse::<RegionId>().unwrap(), *region);
            assert!(!region.name().is_empty());
        }
    }

    #[test]
    fn test_server_address() {
        let config = VpnConfig::default();
        assert_eq!(
            RegionId::UsEast.server_address(&config),
            "us-east.confirmedvpn.com"
        );
    }

    #[test]
    fn test_serde_kebab() {
        let json = serde_json::to_string(&RegionId::ApSingapore).unwrap();
        assert_eq!(json, "\"ap-singapore\"");
    }
}
