//! Whitelist Compiler
//!
//! Turns a whitelist snapshot into the two artifacts the OS consumes:
//!
//! ```text
//!   Whitelist ──▶ normalized domain set ──┬──▶ on-demand rules
//!                                         └──▶ PAC script
//! ```
//!
//! Both artifacts are derived from the same domain set, so a single
//! `CompiledWhitelist` never mixes two snapshots. The function is total:
//! entries that fail hostname validation (a hand-edited store) are
//! dropped with a warning instead of being embedded in the script.

use crate::config::ProxyEndpoint;
use crate::whitelist::{validate_domain, Whitelist};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// PAC body used when nothing is whitelisted
pub const DIRECT_PAC: &str = "function FindProxyForURL(url, host) { return \"DIRECT\"; }";

/// Interface type an on-demand rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceMatch {
    Any,
    Wifi,
    Ethernet,
}

/// OS-level policy deciding whether the tunnel auto-connects.
/// Evaluated in order; the first match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OnDemandRule {
    /// Never bring the tunnel up for connections to these domains
    NeverConnect { domains: Vec<String> },
    /// Always allow connecting for anything else
    Connect { interface: InterfaceMatch },
}

impl OnDemandRule {
    /// The catch-all rule that ends every rule set
    pub fn always_connect() -> Self {
        Self::Connect {
            interface: InterfaceMatch::Any,
        }
    }
}

/// Output of one compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledWhitelist {
    /// Normalized domain patterns (sorted, deduplicated)
    pub domains: BTreeSet<String>,
    /// Ordered on-demand rules
    pub rules: Vec<OnDemandRule>,
    /// Proxy auto-configuration script
    pub pac: String,
}

impl CompiledWhitelist {
    /// Compile a whitelist snapshot
    pub fn compile(list: &Whitelist, proxy: &ProxyEndpoint) -> Self {
        let domains = normalized_domains(list);
        let rules = on_demand_rules(&domains);
        let pac = pac_script(&domains, proxy);
        Self { domains, rules, pac }
    }

    /// Domain list in rule order
    pub fn domain_list(&self) -> Vec<String> {
        self.domains.iter().cloned().collect()
    }

    /// True when no domain bypasses the tunnel
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Evaluate the PAC predicate for a host, with `dnsDomainIs` semantics
    /// (case-insensitive suffix match on the wildcard-stripped domain).
    pub fn bypasses(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.domains
            .iter()
            .any(|pattern| host.ends_with(pac_domain(pattern)))
    }
}

/// Wildcard a domain that has no subdomain label.
///
/// `example` becomes `*.example` and `foo.com` becomes `*.foo.com`;
/// `www.foo.com` and patterns already starting with `*.` pass through.
pub fn normalize_domain(domain: &str) -> String {
    if domain.starts_with("*.") {
        return domain.to_string();
    }
    if domain.split('.').count() <= 2 {
        format!("*.{}", domain)
    } else {
        domain.to_string()
    }
}

/// Domain as used inside `dnsDomainIs`: wildcard label stripped
pub fn pac_domain(pattern: &str) -> &str {
    pattern.strip_prefix("*.").unwrap_or(pattern)
}

/// Flatten both mappings into one normalized set
pub fn normalized_domains(list: &Whitelist) -> BTreeSet<String> {
    list.enabled_domains()
        .filter_map(|domain| match validate_domain(domain) {
            Ok(valid) => Some(normalize_domain(&valid)),
            Err(_) => {
                warn!("Skipping invalid whitelist entry {:?}", domain);
                None
            }
        })
        .collect()
}

/// Build the on-demand rule sequence
pub fn on_demand_rules(domains: &BTreeSet<String>) -> Vec<OnDemandRule> {
    let mut rules = Vec::with_capacity(2);
    if !domains.is_empty() {
        rules.push(OnDemandRule::NeverConnect {
            domains: domains.iter().cloned().collect(),
        });
    }
    rules.push(OnDemandRule::always_connect());
    rules
}

/// Build the PAC script
pub fn pac_script(domains: &BTreeSet<String>, proxy: &ProxyEndpoint) -> String {
    if domains.is_empty() {
        return DIRECT_PAC.to_string();
    }

    let predicate = domains
        .iter()
        .map(|pattern| format!("dnsDomainIs(host, \"{}\")", pac_domain(pattern)))
        .collect::<Vec<_>>()
        .join(" || ");

    format!(
        "function FindProxyForURL(url, host) {{ if ({}) return \"{}; DIRECT\"; return \"DIRECT\"; }}",
        predicate,
        proxy.pac_directive()
    )
}
