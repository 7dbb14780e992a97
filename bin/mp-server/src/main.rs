//! MessagePusher Gateway Server
//!
//! Bootstraps the dispatch engine and the HTTP ingress:
//! 1. load configuration (TOML file + environment overrides)
//! 2. open the store, apply system_config overrides, wire the engine
//! 3. start queue workers and the scheduler
//! 4. serve the API until SIGINT/SIGTERM, then stop components in reverse

use std::sync::Arc;

use anyhow::Result;
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use mp_api::create_router;
use mp_config::ConfigLoader;
use mp_dispatch::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    mp_common::logging::init_logging("mp-server");

    info!("Starting MessagePusher Gateway");

    let config = ConfigLoader::new().load()?;
    let addr = format!("{}:{}", config.http.host, config.http.port);

    let engine = Arc::new(Engine::init(config).await?);
    engine.start().await;

    let app = create_router(engine.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    info!(addr = %addr, "Starting HTTP API server");
    let listener = TcpListener::bind(&addr).await?;
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "HTTP server exited");
        }
    });

    info!("MessagePusher started. Press Ctrl+C to shutdown.");
    shutdown_signal().await;
    info!("Shutdown signal received...");

    engine.stop().await;
    server_task.abort();

    info!("MessagePusher shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
