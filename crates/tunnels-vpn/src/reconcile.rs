//! Reconciliation Loop
//!
//! A single actor owns the desired state, the reconnect throttle and the
//! stuck-connecting timers. Every trigger is a message on one channel, so
//! passes never overlap and a burst of triggers collapses into one pass.
//!
//! ```text
//!   tick (10s) ──┐
//!   wake ────────┤
//!   reachable ───┼──▶ mpsc ──▶ Reconciler ──┬──▶ ProxyLifecycle
//!   status ──────┤                          ├──▶ TunnelManager
//!   set_desired ─┘                          └──▶ watch<StatusEvent>
//! ```
//!
//! # Pass
//!
//! 1. Network unreachable: stop the proxy, nothing else.
//! 2. Desired connected:
//!    - tunnel connecting/connected: make sure the proxy runs.
//!    - otherwise: unless an attempt was made within the throttle window,
//!      start proxy and tunnel, and arm a stuck-connecting check.
//! 3. Desired disconnected and tunnel connecting/connected: stop both.
//!    A proxy left running by a failed start is stopped as well.
//!
//! A tunnel still `Connecting` when its stuck check fires is stopped and
//! restarted once after a short delay.

use crate::config::VpnConfig;
use crate::kill_switch::KillSwitch;
use crate::proxy::ProxyLifecycle;
use crate::reachability::ReachabilityGate;
use crate::settings::{ControllerSettings, DesiredState, SettingsError, SettingsStore};
use crate::tunnel::{TunnelManager, TunnelStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Inbox depth; triggers beyond this are dropped since a pass is queued
const INBOX_CAPACITY: usize = 64;

/// Events that request a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic timer
    Tick,
    /// Device woke from sleep
    Wake,
    /// Network went from unreachable to reachable
    ReachabilityRestored,
    /// OS reported a tunnel status change
    TunnelStatusChanged(TunnelStatus),
    /// Early retry after a pass found the network unreachable
    UnreachableRetry,
}

/// Result of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Network unreachable, proxy stopped
    Unreachable,
    /// Tunnel already up or coming up, proxy ensured
    Converging,
    /// Divergence, but a reconnect was attempted too recently
    Throttled,
    /// A restart is already scheduled
    RestartPending,
    /// Tunnel start issued
    StartIssued,
    /// Tunnel start rejected by the OS
    StartFailed,
    /// Tunnel and proxy stopped
    Stopped,
    /// Nothing to do
    Idle,
}

/// What the UI renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusEvent {
    pub tunnel: TunnelStatus,
    pub proxy_active: bool,
    pub desired: DesiredState,
}

type SettingsUpdate = Box<dyn FnOnce(&mut ControllerSettings) + Send>;

enum Message {
    Trigger(Trigger),
    SetDesired(DesiredState),
    Reconnect,
    StuckCheck(u64),
    Restart(u64),
    UpdateSettings(SettingsUpdate, oneshot::Sender<ControllerSettings>),
    RunPass(oneshot::Sender<PassOutcome>),
    Shutdown(oneshot::Sender<()>),
}

/// Collaborators the loop drives
pub struct ReconcilerParts {
    pub config: Arc<VpnConfig>,
    pub tunnel: TunnelManager,
    pub proxy: Arc<ProxyLifecycle>,
    pub reachability: Arc<dyn ReachabilityGate>,
    pub kill_switch: Arc<KillSwitch>,
    pub settings: SettingsStore,
}

/// The reconciliation actor
pub struct Reconciler {
    config: Arc<VpnConfig>,
    tunnel: TunnelManager,
    proxy: Arc<ProxyLifecycle>,
    reachability: Arc<dyn ReachabilityGate>,
    kill_switch: Arc<KillSwitch>,
    store: SettingsStore,
    settings: ControllerSettings,
    last_reconnect_attempt: Option<Instant>,
    /// Bumped on every start, restart and desired-state change. Timers
    /// carry the value they were armed with and are ignored once it moves.
    attempt: u64,
    restart_pending: bool,
    unreachable_retry_pending: bool,
    timers: Vec<JoinHandle<()>>,
    inbox: mpsc::Receiver<Message>,
    outbox: mpsc::WeakSender<Message>,
    status: watch::Sender<StatusEvent>,
}

impl Reconciler {
    /// Build the actor from persisted settings
    pub fn new(parts: ReconcilerParts) -> Result<(Self, ReconcileHandle), SettingsError> {
        let settings = parts.settings.load()?;
        parts.kill_switch.set_enabled(settings.force_vpn_on);
        info!(
            "Reconciler starting, desired state {} (region {})",
            settings.desired_state, settings.region
        );

        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (status, status_rx) = watch::channel(StatusEvent {
            desired: settings.desired_state,
            ..StatusEvent::default()
        });

        let reconciler = Self {
            config: parts.config,
            tunnel: parts.tunnel,
            proxy: parts.proxy,
            reachability: parts.reachability,
            kill_switch: parts.kill_switch,
            store: parts.settings,
            settings,
            last_reconnect_attempt: None,
            attempt: 0,
            restart_pending: false,
            unreachable_retry_pending: false,
            timers: Vec::new(),
            inbox,
            outbox: tx.downgrade(),
            status,
        };
        let handle = ReconcileHandle { tx, status: status_rx };
        Ok((reconciler, handle))
    }

    /// Spawn the actor on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        let forwarder = self.forward_tunnel_status();
        let mut ticker = tokio::time::interval(self.config.timings.reconcile_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lookahead = None;

        loop {
            let message = match lookahead.take() {
                Some(message) => message,
                None => tokio::select! {
                    _ = ticker.tick() => Message::Trigger(Trigger::Tick),
                    received = self.inbox.recv() => match received {
                        Some(message) => message,
                        None => break,
                    },
                },
            };

            match message {
                Message::Trigger(trigger) => {
                    let (coalesced, next) = self.drain_triggers();
                    lookahead = next;
                    debug!("Reconcile pass on {:?} ({} coalesced)", trigger, coalesced);
                    self.reconcile().await;
                }
                Message::Shutdown(done) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    break;
                }
                other => self.handle(other).await,
            }
            self.publish().await;
        }

        forwarder.abort();
        self.cancel_timers();
        debug!("Reconciler exited");
    }

    /// Swallow queued triggers; the pass about to run covers them.
    /// Returns the count and the first non-trigger message, if any.
    fn drain_triggers(&mut self) -> (usize, Option<Message>) {
        let mut coalesced = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(Message::Trigger(_)) => coalesced += 1,
                Ok(other) => return (coalesced, Some(other)),
                Err(_) => return (coalesced, None),
            }
        }
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::SetDesired(state) => self.set_desired(state).await,
            Message::Reconnect => self.reconnect().await,
            Message::StuckCheck(attempt) => self.stuck_check(attempt).await,
            Message::Restart(attempt) => self.restart(attempt).await,
            Message::UpdateSettings(update, reply) => {
                update(&mut self.settings);
                self.kill_switch.set_enabled(self.settings.force_vpn_on);
                self.persist();
                let _ = reply.send(self.settings.clone());
            }
            Message::RunPass(reply) => {
                let outcome = self.reconcile().await;
                let _ = reply.send(outcome);
            }
            Message::Trigger(_) | Message::Shutdown(_) => {}
        }
    }

    /// One reconciliation pass
    pub async fn reconcile(&mut self) -> PassOutcome {
        let reachable = self.reachability.is_reachable().await;
        let desired = self.settings.desired_state;
        let _ = self.kill_switch.apply(reachable, desired).await;

        if !reachable {
            if self.proxy.is_running() {
                info!("Network unreachable, stopping local proxy");
            }
            self.proxy.stop().await;
            if !self.unreachable_retry_pending {
                self.unreachable_retry_pending = true;
                self.schedule(
                    self.config.timings.unreachable_retry(),
                    Message::Trigger(Trigger::UnreachableRetry),
                );
            }
            return PassOutcome::Unreachable;
        }
        self.unreachable_retry_pending = false;

        let actual = self.tunnel.status().await;

        if !desired.is_connected() {
            if actual.is_up() {
                info!("Tunnel {} but desired disconnected, stopping", actual);
                self.stop_both().await;
                return PassOutcome::Stopped;
            }
            if self.proxy.is_running() {
                info!("Desired disconnected, stopping local proxy");
                self.proxy.stop().await;
                return PassOutcome::Stopped;
            }
            return PassOutcome::Idle;
        }

        if actual.is_up() {
            self.ensure_proxy().await;
            return PassOutcome::Converging;
        }

        if self.restart_pending {
            debug!("Tunnel {}, restart already scheduled", actual);
            return PassOutcome::RestartPending;
        }

        if let Some(last) = self.last_reconnect_attempt {
            let since = last.elapsed();
            if since < self.config.timings.reconnect_throttle() {
                debug!("Tunnel {}, reconnect throttled ({:?} since last attempt)", actual, since);
                return PassOutcome::Throttled;
            }
        }

        info!("Tunnel {} but desired connected, reconnecting", actual);
        self.start_both().await
    }

    async fn set_desired(&mut self, state: DesiredState) {
        if self.settings.set_desired(state) {
            info!("Desired state set to {}", state);
        }
        self.persist();

        // Explicit intent: drop pending timers and the throttle
        self.attempt += 1;
        self.cancel_timers();
        self.restart_pending = false;
        self.unreachable_retry_pending = false;
        self.last_reconnect_attempt = None;

        self.reconcile().await;
    }

    /// Reconfigured tunnel: cycle it so the new profile takes effect
    async fn reconnect(&mut self) {
        if !self.settings.desired_state.is_connected() {
            debug!("Tunnel reconfigured while disconnected, nothing to cycle");
            return;
        }
        info!("Tunnel reconfigured, reconnecting");
        if let Err(e) = self.tunnel.stop().await {
            warn!("Tunnel stop before reconnect failed: {}", e);
        }
        self.arm_restart();
    }

    async fn stuck_check(&mut self, attempt: u64) {
        if attempt != self.attempt || self.restart_pending || !self.settings.desired_state.is_connected() {
            return;
        }
        let status = self.tunnel.status().await;
        if !status.is_connecting() {
            return;
        }

        warn!(
            "Tunnel stuck connecting for {:?}, forcing reconnect",
            self.config.timings.stuck_connecting()
        );
        self.stop_both().await;
        self.last_reconnect_attempt = Some(Instant::now());
        self.arm_restart();
    }

    async fn restart(&mut self, attempt: u64) {
        if attempt != self.attempt {
            return;
        }
        self.restart_pending = false;
        if !self.settings.desired_state.is_connected() {
            return;
        }
        info!("Restarting tunnel");
        self.start_both().await;
    }

    /// Schedule the delayed start. Any stuck check or restart armed
    /// earlier goes stale.
    fn arm_restart(&mut self) {
        self.attempt += 1;
        self.restart_pending = true;
        self.schedule(
            self.config.timings.stuck_restart_delay(),
            Message::Restart(self.attempt),
        );
    }

    async fn start_both(&mut self) -> PassOutcome {
        self.attempt += 1;
        self.last_reconnect_attempt = Some(Instant::now());
        self.ensure_proxy().await;

        match self.tunnel.start().await {
            Ok(()) => {
                self.schedule(
                    self.config.timings.stuck_connecting(),
                    Message::StuckCheck(self.attempt),
                );
                PassOutcome::StartIssued
            }
            Err(e) => {
                error!("{}", e);
                PassOutcome::StartFailed
            }
        }
    }

    async fn stop_both(&mut self) {
        if let Err(e) = self.tunnel.stop().await {
            warn!("Tunnel stop failed: {}", e);
        }
        self.proxy.stop().await;
    }

    async fn ensure_proxy(&self) {
        if let Err(e) = self.proxy.start().await {
            warn!("Local proxy failed to start: {}", e);
        }
    }

    async fn shutdown(&mut self) {
        info!("Reconciler shutting down");
        self.cancel_timers();
        let _ = self.kill_switch.release().await;
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.settings) {
            warn!("Failed to persist settings: {}", e);
        }
    }

    /// Post `message` back to the inbox after `delay`
    fn schedule(&mut self, delay: Duration, message: Message) {
        self.timers.retain(|timer| !timer.is_finished());
        let outbox = self.outbox.clone();
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = outbox.upgrade() {
                let _ = tx.send(message).await;
            }
        }));
    }

    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }

    /// Relay OS status changes into the inbox
    fn forward_tunnel_status(&self) -> JoinHandle<()> {
        let mut events = self.tunnel.subscribe();
        let outbox = self.outbox.clone();

        tokio::spawn(async move {
            loop {
                let status = match events.recv().await {
                    Ok(status) => status,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Missed {} tunnel status events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(tx) = outbox.upgrade() else { break };
                let _ = tx.try_send(Message::Trigger(Trigger::TunnelStatusChanged(status)));
            }
        })
    }

    async fn publish(&self) {
        let event = StatusEvent {
            tunnel: self.tunnel.status().await,
            proxy_active: self.proxy.is_running(),
            desired: self.settings.desired_state,
        };
        self.status.send_if_modified(|current| {
            if *current == event {
                return false;
            }
            debug!("Status: tunnel {}, proxy active {}", event.tunnel, event.proxy_active);
            *current = event;
            true
        });
    }
}

/// Cloneable handle to the running loop
#[derive(Clone)]
pub struct ReconcileHandle {
    tx: mpsc::Sender<Message>,
    status: watch::Receiver<StatusEvent>,
}

impl ReconcileHandle {
    /// Request a pass. Never blocks; a full inbox already holds a pass.
    pub fn trigger(&self, trigger: Trigger) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(Message::Trigger(trigger)) {
            debug!("Reconcile inbox full, dropping {:?}", trigger);
        }
    }

    /// Record the user's intent; a pass follows immediately
    pub async fn set_desired_state(&self, state: DesiredState) -> Result<(), ReconcileError> {
        self.send(Message::SetDesired(state)).await
    }

    /// Cycle the tunnel after its profile changed
    pub async fn reconnect(&self) -> Result<(), ReconcileError> {
        self.send(Message::Reconnect).await
    }

    /// Edit persisted settings inside the loop
    pub async fn update_settings<F>(&self, update: F) -> Result<ControllerSettings, ReconcileError>
    where
        F: FnOnce(&mut ControllerSettings) + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Message::UpdateSettings(Box::new(update), reply)).await?;
        rx.await.map_err(|_| ReconcileError::Closed)
    }

    /// Current settings
    pub async fn settings(&self) -> Result<ControllerSettings, ReconcileError> {
        self.update_settings(|_| {}).await
    }

    /// Run a pass now and wait for its outcome
    pub async fn reconcile_now(&self) -> Result<PassOutcome, ReconcileError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::RunPass(reply)).await?;
        rx.await.map_err(|_| ReconcileError::Closed)
    }

    /// Stop the loop and release the system proxy
    pub async fn shutdown(&self) -> Result<(), ReconcileError> {
        let (done, rx) = oneshot::channel();
        self.send(Message::Shutdown(done)).await?;
        rx.await.map_err(|_| ReconcileError::Closed)
    }

    /// Latest status
    pub fn status(&self) -> StatusEvent {
        *self.status.borrow()
    }

    /// Status changes
    pub fn subscribe(&self) -> watch::Receiver<StatusEvent> {
        self.status.clone()
    }

    async fn send(&self, message: Message) -> Result<(), ReconcileError> {
        self.tx.send(message).await.map_err(|_| ReconcileError::Closed)
    }
}

/// Reconcile loop errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("Reconcile loop is not running")]
    Closed,
}
