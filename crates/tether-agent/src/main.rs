//! tether agent binary.
//!
//! Usage: `tether-agent [config.yaml]` (defaults to `tether.yaml`).
//! Log level comes from `RUST_LOG`, `info` when unset.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use tether_agent::dispatch::Dispatcher;
use tether_agent::lifecycle::NoopSync;
use tether_agent::services::PingService;
use tether_agent::{config, Agent};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "tether.yaml".to_string());
    let cfg = match config::load_from_file(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(%path, error = %e, "config load failed");
            return ExitCode::from(2);
        }
    };

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register_rpc(Arc::new(PingService));

    let agent = Agent::new(cfg, dispatcher, Arc::new(NoopSync));
    agent.start();

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    agent.shutdown().await;

    tracing::info!(metrics = %agent.render_metrics(), "final metrics");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl_c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
