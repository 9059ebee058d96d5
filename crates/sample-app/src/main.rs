//! `sample-app`: instrumented HTTP service entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise service diagnostics (JSON `tracing` output on stderr).
//! 3. Start telemetry: probe destinations, install OTLP exporters, build the
//!    emitter that routes logs, spans and metrics along separate paths.
//! 4. Seed the simulated [`Database`].
//! 5. Build the Axum router and serve until Ctrl-C or SIGTERM.
//! 6. Drain buffered telemetry and flush the exporters.

mod config;
mod db;
mod latency;
mod server;
mod telemetry;

use anyhow::{Context, Result};
use correlation::Level;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Config;
use db::Database;
use latency::Latency;
use server::state::AppState;
use telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Diagnostics are not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Diagnostics
    // -----------------------------------------------------------------------
    telemetry::init_diagnostics(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.port,
        service = %cfg.otel_service_name,
        "sample-app starting"
    );

    // -----------------------------------------------------------------------
    // 3. Telemetry
    // -----------------------------------------------------------------------
    let telemetry = Telemetry::start(&cfg).await?;
    let emitter = telemetry.emitter().clone();
    emitter.log_untraced(Level::Info, "Starting Sample App with OpenTelemetry instrumentation");
    emitter.log_untraced(
        Level::Info,
        format!("OTLP Endpoint: {}", cfg.otel_exporter_otlp_endpoint),
    );

    // -----------------------------------------------------------------------
    // 4. Simulated database
    // -----------------------------------------------------------------------
    let latency = Latency::new(cfg.simulate_latency);
    let db = Database::new(latency, cfg.db_failure_rate);

    // -----------------------------------------------------------------------
    // 5. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState::new(emitter, db, latency);
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());
    let served = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await;

    // -----------------------------------------------------------------------
    // 6. Shutdown
    // -----------------------------------------------------------------------
    telemetry.emitter().log_untraced(Level::Info, "Shutting down Sample App");
    telemetry.shutdown().await;
    info!("sample-app stopped");

    served.context("HTTP server failed")
}

/// Cancel `token` on Ctrl-C or, on Unix, SIGTERM.
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
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
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }
        info!("shutdown signal received");
        token.cancel();
    });
}
