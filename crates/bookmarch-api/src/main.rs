//! Bookmarch server entrypoint.
//!
//! Starts the orchestration runtime (stage worker pools + health monitor)
//! and serves the REST/WebSocket API. Shutdown is graceful: Ctrl-C stops
//! accepting connections, then the runtime drains in-flight jobs before
//! the process exits.

mod http;
mod stages;
mod state;

use clap::Parser;

use crate::http::router::build_router;
use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "bookmarch", about = "Bookmark pipeline orchestration engine")]
struct Args {
    /// Address to bind the API server on.
    #[arg(long, default_value = "127.0.0.1", env = "BOOKMARCH_HOST")]
    host: String,

    /// Port to bind the API server on.
    #[arg(long, default_value_t = 7870, env = "BOOKMARCH_PORT")]
    port: u16,

    /// Enable OpenTelemetry span export (stdout exporter).
    #[arg(long, env = "BOOKMARCH_OTEL")]
    otel: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    bookmarch_observe::tracing_setup::init_tracing(args.otel)
        .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;

    let state = AppState::init().await?;
    state.runtime.start().await?;

    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    tracing::info!(host = args.host.as_str(), port = args.port, "bookmarch listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("draining worker pools");
    state.runtime.shutdown().await;
    bookmarch_observe::tracing_setup::shutdown_tracing();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
    }
}
