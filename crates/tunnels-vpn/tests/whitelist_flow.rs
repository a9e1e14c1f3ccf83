//! Whitelisting a domain end to end: store, compiler, tunnel profile.

use std::sync::Arc;
use tunnels_vpn::{
    MemoryBackend, ManualReachability, NoSystemProxy, OnDemandRule, VpnConfig, VpnController,
    WhitelistStore,
};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_add_domain_reconfigures_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = VpnConfig {
        data_dir: dir.path().to_path_buf(),
        ..VpnConfig::default()
    };
    config.proxy.port = free_port();
    let port = config.proxy.port;

    let backend = Arc::new(MemoryBackend::new());
    let vpn = VpnController::start(
        config.clone(),
        backend.clone(),
        Arc::new(ManualReachability::new(true)),
        Arc::new(NoSystemProxy),
    )
    .await
    .unwrap();
    vpn.install_identity("client-1", "AAECAwQFBgc=").await.unwrap();
    let saves_before = backend.counters().saves();

    let compiled = vpn.add_whitelist_domain("example.com").await.unwrap();

    // PAC clause for the new domain, routed to the loopback proxy
    assert!(compiled.pac.contains("dnsDomainIs(host, \"example.com\")"));
    assert!(compiled.pac.contains(&format!("PROXY 127.0.0.1:{}; DIRECT", port)));

    // Tunnel profile rewritten
    assert_eq!(backend.counters().saves(), saves_before + 1);
    let profile = backend.profile().await.unwrap();
    match &profile.on_demand_rules[0] {
        OnDemandRule::NeverConnect { domains } => {
            assert!(domains.iter().any(|d| d == "*.example.com"));
        }
        other => panic!("first rule should exclude whitelisted domains, got {:?}", other),
    }
    assert_eq!(
        profile.on_demand_rules.last(),
        Some(&OnDemandRule::always_connect())
    );

    // Persisted where the tunnel extension reads it
    let stored = WhitelistStore::new(config.whitelist_path()).load().unwrap();
    assert!(stored.user.get("example.com").copied().unwrap_or(false));

    vpn.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabling_everything_yields_direct_pac() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = VpnConfig {
        data_dir: dir.path().to_path_buf(),
        ..VpnConfig::default()
    };
    config.proxy.port = free_port();

    let vpn = VpnController::start(
        config,
        Arc::new(MemoryBackend::new()),
        Arc::new(ManualReachability::new(true)),
        Arc::new(NoSystemProxy),
    )
    .await
    .unwrap();

    for entry in vpn.whitelist().unwrap().entries() {
        vpn.toggle_whitelist_domain(entry.source, &entry.domain, false)
            .await
            .unwrap();
    }

    let compiled = vpn.compiled_whitelist().unwrap();
    assert_eq!(compiled.pac, tunnels_vpn::DIRECT_PAC);
    assert_eq!(compiled.rules, vec![OnDemandRule::always_connect()]);

    vpn.shutdown().await.unwrap();
}
