//! QTE Battle Server - authoritative timing and resolution for grid tactics
//!
//! Every battle runs as its own task. Clients connect over WebSocket, join a
//! battle created through the HTTP API, and answer attack, defense and chain
//! QTEs whose windows are scheduled on the server clock.

mod app;
mod battle;
mod config;
mod http;
mod qte;
mod util;
mod ws;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::AppState;
use crate::config::Config;
use crate::http::build_router;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(&config);
    init_server_time();

    info!(
        addr = %config.server_addr,
        future_delay_ms = config.tuning.future_delay_ms,
        tolerance_ms = config.tuning.tolerance_ms,
        timeout_buffer_ms = config.tuning.timeout_buffer_ms,
        enforce_simple_timing = config.tuning.enforce_simple_timing,
        "Starting QTE Battle Server"
    );

    let addr = config.server_addr;
    let state = AppState::new(config);
    let battles = state.battles.clone();

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Listening (GET /health, GET /ws, POST /battles)");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        active_battles = battles.active_battles(),
        "Server stopped"
    );
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolves on Ctrl+C or SIGTERM. A signal source that cannot be installed
/// is logged and never fires.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let source = tokio::select! {
        _ = interrupt => "interrupt",
        _ = terminate => "terminate",
    };
    info!(signal = source, "Shutting down");
}
