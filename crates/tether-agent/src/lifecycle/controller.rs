//! Connection lifecycle controller.
//!
//! Three signal sources drive the state machine: the connect loop, the auth
//! attempt and the periodic watcher. Every transition is a compare-and-swap on
//! `StateCell`, and each attempt kind is single-flight behind its own flag.
//!
//! Guards are cleared on disconnect. The connect loop carries the epoch it was
//! started in and exits once a disconnect has bumped it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tether_core::error::{Result, TetherError};
use tether_core::packet::{AuthResponse, Packet};

use crate::config::AgentConfig;
use crate::lifecycle::backoff::Backoff;
use crate::lifecycle::state::{ConnectionState, StateCell};
use crate::lifecycle::sync::SyncSource;
use crate::obs::AgentMetrics;
use crate::transport::TransportManager;

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub address: String,
    pub token: String,
    pub initial_delay: Duration,
    pub max_backoff: Duration,
    /// Watcher period; also paces auth retries after a rejection.
    pub watch_interval: Duration,
    pub auth_timeout: Duration,
}

impl From<&AgentConfig> for LifecycleOptions {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            address: cfg.backend.address(),
            token: cfg.auth.token.clone(),
            initial_delay: cfg.reconnect.initial_delay(),
            max_backoff: cfg.reconnect.max_backoff(),
            watch_interval: cfg.auth.retry_interval(),
            auth_timeout: cfg.rpc.default_timeout(),
        }
    }
}

pub struct LifecycleController {
    me: Weak<LifecycleController>,
    opts: LifecycleOptions,
    manager: Arc<TransportManager>,
    sync: Arc<dyn SyncSource>,
    metrics: Arc<AgentMetrics>,
    state: StateCell,

    connecting: AtomicBool,
    authenticating: AtomicBool,
    sync_started: AtomicBool,
    epoch: AtomicU64,

    backoff: Mutex<Backoff>,
    session_id: RwLock<Option<String>>,
    shutdown: watch::Receiver<bool>,
}

impl LifecycleController {
    pub fn new(
        opts: LifecycleOptions,
        manager: Arc<TransportManager>,
        sync: Arc<dyn SyncSource>,
        metrics: Arc<AgentMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let backoff = Backoff::new(opts.initial_delay, opts.max_backoff);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            opts,
            manager,
            sync,
            metrics,
            state: StateCell::default(),
            connecting: AtomicBool::new(false),
            authenticating: AtomicBool::new(false),
            sync_started: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            backoff: Mutex::new(backoff),
            session_id: RwLock::new(None),
            shutdown,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Server-assigned id of the current authenticated session.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|s| s.clone())
    }

    pub fn manager(&self) -> &Arc<TransportManager> {
        &self.manager
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let ok = self.state.transition(from, to);
        if ok {
            self.metrics.state_transitions.inc(&[("to", to.as_str())]);
        }
        ok
    }

    fn force(&self, to: ConnectionState) {
        if self.state.force(to) != to {
            self.metrics.state_transitions.inc(&[("to", to.as_str())]);
        }
    }

    fn set_session_id(&self, id: Option<String>) {
        if let Ok(mut slot) = self.session_id.write() {
            *slot = id;
        }
    }

    fn next_delay(&self) -> Duration {
        self.backoff
            .lock()
            .map(|mut b| b.next_delay())
            .unwrap_or(self.opts.initial_delay)
    }

    fn reset_backoff(&self) {
        if let Ok(mut b) = self.backoff.lock() {
            b.reset();
        }
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) != epoch || self.is_shutting_down()
    }

    // ---- connect ----------------------------------------------------------

    /// Start the connect loop unless one is already running.
    ///
    /// With `delay_first` the loop waits one backoff step before its first attempt.
    pub fn start_connect(&self, delay_first: bool) {
        if self.is_shutting_down() {
            return;
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("connect already in flight");
            return;
        }
        let Some(this) = self.me.upgrade() else {
            self.connecting.store(false, Ordering::Release);
            return;
        };
        let epoch = self.epoch.load(Ordering::Acquire);
        tokio::spawn(this.connect_loop(epoch, delay_first));
    }

    async fn connect_loop(self: Arc<Self>, epoch: u64, mut delay_first: bool) {
        let mut shutdown = self.shutdown.clone();

        loop {
            if self.is_stale(epoch) {
                break;
            }
            if delay_first {
                let delay = self.next_delay();
                tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                if self.is_stale(epoch) {
                    break;
                }
            }
            delay_first = true;

            if self.manager.is_connected() {
                break;
            }
            self.transition(ConnectionState::Disconnected, ConnectionState::Connecting);

            match self.manager.connect(&self.opts.address).await {
                // on_transport_connected has already run via the listener
                Ok(()) => {
                    if self.is_shutting_down() {
                        self.manager.disconnect().await;
                    }
                    break;
                }
                Err(e) => {
                    self.metrics
                        .connect_failures
                        .inc(&[("code", e.code().as_str())]);
                    self.transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                }
            }
        }

        if self.epoch.load(Ordering::Acquire) == epoch {
            self.connecting.store(false, Ordering::Release);
        }
    }

    /// Socket established.
    pub fn on_transport_connected(&self) {
        self.reset_backoff();
        if !self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            self.transition(ConnectionState::Disconnected, ConnectionState::Connected);
        }
        self.start_auth();
    }

    // ---- authenticate -----------------------------------------------------

    /// Start an auth attempt unless one is in flight or the link is already authenticated.
    pub fn start_auth(&self) {
        if self.manager.is_authenticated() {
            self.on_authenticated();
            return;
        }
        if self
            .authenticating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("auth already in flight");
            return;
        }
        let Some(this) = self.me.upgrade() else {
            self.authenticating.store(false, Ordering::Release);
            return;
        };
        let epoch = self.epoch.load(Ordering::Acquire);
        tokio::spawn(async move {
            match this.authenticate().await {
                Ok(()) => {}
                Err(TetherError::AuthenticationRejected(reason)) => {
                    tracing::warn!(%reason, "authentication rejected; will retry");
                }
                Err(e) => tracing::warn!(error = %e, "authentication attempt failed"),
            }
            // after a disconnect the flag may belong to a newer attempt
            if this.epoch.load(Ordering::Acquire) == epoch {
                this.authenticating.store(false, Ordering::Release);
            }
        });
    }

    async fn authenticate(&self) -> Result<()> {
        self.metrics.auth_attempts.inc(&[]);
        let resp = self
            .manager
            .request_with_timeout(Packet::auth_request(&self.opts.token), self.opts.auth_timeout)
            .await?;

        let auth = AuthResponse::from_packet(&resp);
        if !auth.success {
            return Err(TetherError::AuthenticationRejected(auth.message));
        }
        if !self.manager.is_connected() {
            return Err(TetherError::NotConnected);
        }

        self.manager.set_authenticated(true);
        tracing::info!(server_id = %auth.server_id, "authenticated");
        self.set_session_id(Some(auth.server_id));
        self.on_authenticated();
        Ok(())
    }

    /// Auth success observed, from the attempt task or the watcher.
    pub fn on_authenticated(&self) {
        let cur = self.state.get();
        if matches!(cur, ConnectionState::Connected | ConnectionState::Connecting) {
            self.transition(cur, ConnectionState::Authenticated);
        }
        self.try_start_sync();
    }

    /// CAS up to `Authenticated` from any earlier state; never moves backwards.
    fn advance_to_authenticated(&self) {
        for from in [
            ConnectionState::Connected,
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
        ] {
            if self.transition(from, ConnectionState::Authenticated) {
                return;
            }
        }
    }

    // ---- sync -------------------------------------------------------------

    fn try_start_sync(&self) {
        if self
            .sync_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if !self.transition(ConnectionState::Authenticated, ConnectionState::Syncing) {
            self.sync_started.store(false, Ordering::Release);
            return;
        }
        let Some(this) = self.me.upgrade() else { return };
        tokio::spawn(async move { this.run_sync().await });
    }

    async fn run_sync(&self) {
        tracing::info!("initial sync started");
        if let Err(e) = self.sync.sync_online().await {
            tracing::warn!(error = %e, "online sync failed");
        }
        if let Err(e) = self.sync.sync_offline().await {
            tracing::warn!(error = %e, "offline sync failed");
        }
        if self.transition(ConnectionState::Syncing, ConnectionState::Ready) {
            tracing::info!("link ready");
        }
    }

    // ---- disconnect / errors ----------------------------------------------

    fn clear_guards(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.connecting.store(false, Ordering::Release);
        self.authenticating.store(false, Ordering::Release);
        self.sync_started.store(false, Ordering::Release);
    }

    fn reset_to_disconnected(&self) {
        self.manager.set_authenticated(false);
        self.set_session_id(None);
        self.force(ConnectionState::Disconnected);
        self.clear_guards();
    }

    /// Transport session ended. Schedules a reconnect unless shutting down.
    pub fn on_transport_disconnected(&self) {
        self.reset_to_disconnected();
        if !self.is_shutting_down() {
            self.start_connect(true);
        }
    }

    pub fn on_transport_error(&self, err: &TetherError) {
        if err.is_fatal_to_connection() {
            tracing::warn!(code = err.code().as_str(), error = %err, "transport error");
        } else {
            tracing::debug!(code = err.code().as_str(), error = %err, "transport error");
        }
    }

    // ---- watcher ----------------------------------------------------------

    /// Bring the state machine back in line with what the transport reports.
    pub fn reconcile(&self) {
        if self.is_shutting_down() {
            return;
        }
        let state = self.state.get();

        if !self.manager.is_connected() {
            if state >= ConnectionState::Connected {
                tracing::warn!(%state, "transport is down; resetting lifecycle");
                self.reset_to_disconnected();
            }
            self.start_connect(false);
            return;
        }

        if self.manager.is_authenticated() {
            if state < ConnectionState::Authenticated {
                tracing::info!(%state, "auth observed by watcher; advancing");
                self.advance_to_authenticated();
            }
            self.try_start_sync();
            return;
        }

        if state < ConnectionState::Connected {
            self.force(ConnectionState::Connected);
        }
        self.start_auth();
    }

    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.opts.watch_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => this.reconcile(),
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("lifecycle watcher stopped");
        })
    }
}
