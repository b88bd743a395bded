//! Agent wiring.
//!
//! Builds the store, transport, manager, lifecycle controller and link handler
//! from one `AgentConfig`, and owns the background tasks and shutdown signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::dispatch::{Dispatcher, LinkHandler};
use crate::lifecycle::{ConnectionState, LifecycleController, LifecycleOptions, SyncSource};
use crate::obs::AgentMetrics;
use crate::rpc::CorrelationStore;
use crate::transport::{FramedTransport, TransportManager, TransportOptions};

pub struct Agent {
    cfg: AgentConfig,
    metrics: Arc<AgentMetrics>,
    store: Arc<CorrelationStore>,
    manager: Arc<TransportManager>,
    lifecycle: Arc<LifecycleController>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(cfg: AgentConfig, dispatcher: Arc<Dispatcher>, sync: Arc<dyn SyncSource>) -> Self {
        let metrics = Arc::new(AgentMetrics::default());
        let store = Arc::new(CorrelationStore::new());
        let transport = FramedTransport::new(TransportOptions::from(&cfg));
        let manager = Arc::new(TransportManager::new(
            transport,
            Arc::clone(&store),
            cfg.rpc.default_timeout(),
            Arc::clone(&metrics),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let lifecycle = LifecycleController::new(
            LifecycleOptions::from(&cfg),
            Arc::clone(&manager),
            sync,
            Arc::clone(&metrics),
            shutdown_rx,
        );

        let handler = LinkHandler::new(
            Arc::clone(&manager),
            Arc::clone(&dispatcher),
            Arc::downgrade(&lifecycle),
            Arc::clone(&metrics),
        );
        manager.transport().set_listener(Arc::new(handler));

        Self {
            cfg,
            metrics,
            store,
            manager,
            lifecycle,
            dispatcher,
            shutdown_tx,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the sweeper and watcher and make the first connect attempt. Runs once.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(
            backend = %self.cfg.backend.address(),
            rpc_actions = ?self.dispatcher.registered_rpc_actions(),
            "tether agent starting"
        );

        let sweeper = self
            .store
            .spawn_sweeper(self.cfg.rpc.sweep_interval(), self.shutdown_tx.subscribe());
        let watcher = self.lifecycle.spawn_watcher();
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(sweeper);
            tasks.push(watcher);
        }

        self.lifecycle.start_connect(false);
    }

    /// Stop background tasks and close the link. Idempotent.
    pub async fn shutdown(&self) {
        self.metrics.set_shutting_down();
        self.shutdown_tx.send_replace(true);

        self.manager.disconnect().await;
        self.manager.transport().clear_listener();

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut t) => t.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for res in futures_util::future::join_all(tasks).await {
            if let Err(e) = res {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("tether agent stopped");
    }

    pub fn cfg(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn manager(&self) -> Arc<TransportManager> {
        Arc::clone(&self.manager)
    }

    pub fn lifecycle(&self) -> Arc<LifecycleController> {
        Arc::clone(&self.lifecycle)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn store(&self) -> Arc<CorrelationStore> {
        Arc::clone(&self.store)
    }

    pub fn metrics(&self) -> Arc<AgentMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Prometheus text for the agent metrics plus the transport snapshot.
    pub fn render_metrics(&self) -> String {
        let snapshot = self.manager.transport().snapshot();
        let mut extra = snapshot.as_metrics();
        extra.push((
            "tether_connection_state",
            self.lifecycle.state() as u8 as u64,
        ));
        self.metrics.render(&extra)
    }
}
