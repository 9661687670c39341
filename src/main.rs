//! Split JSON-RPC proxy.
//!
//! ```text
//!                          ┌──────────────────────────────────────────┐
//!     Client Request       │               SPLIT PROXY                │
//!     ─────────────────────┼─▶ http ──▶ proxy::DispatchEngine         │
//!                          │               │            │             │
//!                          │        stream leg     compare leg ───────┼──▶ Compare endpoint
//!     Client Response      │               │            │             │
//!     ◀────────────────────┼── relay ◀─────┘            ▼             │
//!                          │               │       comparison         │
//!                          │               └──────────▶ (logs)        │
//!                          │                                          │
//!                          │  upstream pool + DNS refresher ──────────┼──▶ Stream endpoint
//!                          └──────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use split_rpc_proxy::admin;
use split_rpc_proxy::config::load_config;
use split_rpc_proxy::lifecycle::{signals, Shutdown};
use split_rpc_proxy::observability::{logging, metrics};
use split_rpc_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "split-rpc-proxy", version, about = "Dual-dispatch JSON-RPC proxy")]
struct Cli {
    /// TOML config file. Environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    logging::init(&config.observability);
    tracing::info!("split-rpc-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        primary_rpc = %config.endpoints.primary_url,
        secondary_rpc = %config.endpoints.secondary_url,
        primary_role = config.endpoints.primary_role.as_str(),
        latency_threshold_ms = config.comparison.latency_threshold_ms,
        size_diff_threshold = config.comparison.size_diff_threshold,
        log_mismatches = config.comparison.log_mismatches,
        request_timeout_ms = config.timeouts.request_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(config.clone())?;
    let engine = server.engine();
    let shutdown = Arc::new(Shutdown::new());

    signals::spawn_signal_handlers(engine.clone(), shutdown.clone())?;
    tracing::info!(pid = std::process::id(), "Send SIGUSR1 to switch primary/secondary roles");

    if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        let router = admin::setup_admin_router(engine.clone(), &config.admin.api_key);
        let mut stop = shutdown.subscribe();
        tracing::info!(address = %config.admin.bind_address, "Admin API listening");
        tokio::spawn(async move {
            let served = axum::serve(admin_listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API stopped with an error");
            }
        });
    }

    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
