//! Tunnels VPN - IKEv2 Tunnel and Whitelist Proxy Controller
//!
//! Keeps an OS-managed IKEv2 tunnel and a local whitelist proxy in line
//! with what the user asked for, even when the OS on-demand machinery
//! drops the tunnel, hangs in negotiation, or the device sleeps.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        VpnController                          │
//! │                                                               │
//! │  Whitelist ──▶ Compiler ──┬──▶ on-demand rules ──┐            │
//! │  (store)                  └──▶ PAC script        ▼            │
//! │                                          ┌──────────────┐     │
//! │  tick / wake / reachable / status ─────▶ │  Reconciler  │     │
//! │  set_desired_state ────────────────────▶ │   (actor)    │     │
//! │                                          └──┬────────┬──┘     │
//! │                                             ▼        ▼        │
//! │                                 ┌──────────────┐ ┌─────────┐  │
//! │                                 │TunnelManager │ │  Proxy  │  │
//! │                                 │ (VpnBackend) │ │ :9090   │  │
//! │                                 └──────────────┘ └─────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Persisted intent**: desired state survives restarts
//! - **Throttled reconnects**: no reconnect storms from bursts of triggers
//! - **Stuck-connecting recovery**: hung negotiations are cycled
//! - **Whitelist bypass**: PAC routes listed domains around the tunnel

mod backend;
mod compiler;
mod config;
mod identity;
mod kill_switch;
mod manager;
mod proxy;
mod reachability;
mod reconcile;
mod region;
mod settings;
mod tunnel;
mod whitelist;

pub use backend::{BackendCounters, ConnectOutcome, MemoryBackend};
pub use compiler::{
    normalize_domain, pac_domain, CompiledWhitelist, InterfaceMatch, OnDemandRule, DIRECT_PAC,
};
pub use config::{
    ConfigError, ProxyEndpoint, ReachabilityConfig, ReconcileTimings, VpnConfig,
    DEFAULT_PROXY_HOST, DEFAULT_PROXY_PORT,
};
pub use identity::{ClientIdentity, IdentityError};
pub use kill_switch::{
    KillSwitch, NetworkSetupProxy, NoSystemProxy, SystemProxy, SystemProxyError,
    SystemProxyState,
};
pub use manager::{VpnController, VpnError};
pub use proxy::{ProxyConfig, ProxyError, ProxyLifecycle};
pub use reachability::{watch_edges, HttpProbe, ManualReachability, ProbeError, ReachabilityGate};
pub use reconcile::{
    PassOutcome, ReconcileError, ReconcileHandle, Reconciler, ReconcilerParts, StatusEvent,
    Trigger,
};
pub use region::{RegionError, RegionId};
pub use settings::{ControllerSettings, DesiredState, SettingsError, SettingsStore};
pub use tunnel::{
    BackendError, CertificateType, DeadPeerDetection, EncryptionAlgorithm, IntegrityAlgorithm,
    SecurityAssociation, TunnelError, TunnelManager, TunnelProfile, TunnelStatus, VpnBackend,
};
pub use whitelist::{
    validate_domain, Whitelist, WhitelistEntry, WhitelistError, WhitelistSource, WhitelistStore,
    CONFIRMED_DEFAULTS,
};
