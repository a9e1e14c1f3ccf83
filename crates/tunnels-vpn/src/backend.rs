//! In-Memory VPN Backend
//!
//! Simulates the OS VPN manager: a saved profile, a status that moves
//! through `Connecting` on start, and a status broadcast. Negotiation can
//! be scripted to connect, hang, or fail, and the configuration store can
//! be made to report stale-configuration errors. Used by tests and by the
//! app's simulation mode.

use crate::tunnel::{BackendError, TunnelProfile, TunnelStatus, VpnBackend};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// How a simulated negotiation ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectOutcome {
    /// Reaches `Connected` after the negotiation delay
    #[default]
    Connect,
    /// Stays in `Connecting` forever
    Hang,
    /// Falls back to `Disconnected` after the negotiation delay
    Fail,
}

/// Call counters
#[derive(Debug, Default)]
pub struct BackendCounters {
    loads: AtomicU64,
    saves: AtomicU64,
    starts: AtomicU64,
    stops: AtomicU64,
}

impl BackendCounters {
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }
}

struct SimState {
    profile: Option<TunnelProfile>,
    status: TunnelStatus,
    outcome: ConnectOutcome,
    negotiation_delay: Duration,
    stale_errors: u32,
    /// Bumped on every start/stop so a stale negotiation can't land
    attempt: u64,
}

/// Simulated OS VPN manager
pub struct MemoryBackend {
    state: Arc<Mutex<SimState>>,
    events: broadcast::Sender<TunnelStatus>,
    counters: Arc<BackendCounters>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(SimState {
                profile: None,
                status: TunnelStatus::Disconnected,
                outcome: ConnectOutcome::Connect,
                negotiation_delay: Duration::from_millis(500),
                stale_errors: 0,
                attempt: 0,
            })),
            events,
            counters: Arc::new(BackendCounters::default()),
        }
    }

    /// Script how the next negotiations end
    pub async fn set_outcome(&self, outcome: ConnectOutcome) {
        self.state.lock().await.outcome = outcome;
    }

    pub async fn set_negotiation_delay(&self, delay: Duration) {
        self.state.lock().await.negotiation_delay = delay;
    }

    /// Make the next `count` saves fail with a stale-configuration error
    pub async fn inject_stale_errors(&self, count: u32) {
        self.state.lock().await.stale_errors = count;
    }

    /// Force a status, as if the OS dropped or changed the tunnel
    pub async fn set_status(&self, status: TunnelStatus) {
        let mut state = self.state.lock().await;
        state.attempt += 1;
        set_and_notify(&mut state, &self.events, status);
    }

    /// Currently saved profile
    pub async fn profile(&self) -> Option<TunnelProfile> {
        self.state.lock().await.profile.clone()
    }

    pub fn counters(&self) -> &BackendCounters {
        &self.counters
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn set_and_notify(state: &mut SimState, events: &broadcast::Sender<TunnelStatus>, status: TunnelStatus) {
    if state.status != status {
        debug!("Simulated tunnel: {} -> {}", state.status, status);
        state.status = status;
        let _ = events.send(status);
    }
}

#[async_trait]
impl VpnBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<TunnelProfile>, BackendError> {
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.state.lock().await.profile.clone())
    }

    async fn save(&self, profile: &TunnelProfile) -> Result<(), BackendError> {
        self.counters.saves.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        if state.stale_errors > 0 {
            state.stale_errors -= 1;
            return Err(BackendError::StaleConfiguration);
        }
        state.profile = Some(profile.clone());
        Ok(())
    }

    async fn start_tunnel(&self) -> Result<(), BackendError> {
        self.counters.starts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;

        match state.profile.as_ref() {
            None => return Err(BackendError::NotConfigured),
            Some(profile) if !profile.enabled => return Err(BackendError::Disabled),
            Some(_) => {}
        }
        if state.status.is_up() {
            return Ok(());
        }

        state.attempt += 1;
        let attempt = state.attempt;
        set_and_notify(&mut state, &self.events, TunnelStatus::Connecting);

        let landing = match state.outcome {
            ConnectOutcome::Connect => TunnelStatus::Connected,
            ConnectOutcome::Fail => TunnelStatus::Disconnected,
            ConnectOutcome::Hang => return Ok(()),
        };
        let delay = state.negotiation_delay;
        let shared = self.state.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = shared.lock().await;
            if state.attempt == attempt && state.status.is_connecting() {
                set_and_notify(&mut state, &events, landing);
            }
        });
        Ok(())
    }

    async fn stop_tunnel(&self) -> Result<(), BackendError> {
        self.counters.stops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        state.attempt += 1;
        if state.status != TunnelStatus::Disconnected {
            set_and_notify(&mut state, &self.events, TunnelStatus::Disconnecting);
            set_and_notify(&mut state, &self.events, TunnelStatus::Disconnected);
        }
        Ok(())
    }

    async fn status(&self) -> TunnelStatus {
        self.state.lock().await.status
    }

    fn subscribe(&self) -> broadcast::Receiver<TunnelStatus> {
        self.events.subscribe()
    }
}
