use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

use campaign_push_service::api;
use campaign_push_service::config;
use campaign_push_service::ingest;
use campaign_push_service::state;

async fn run_server(app_state: Arc<state::AppState>, token: CancellationToken) {
    let listen_addr_str = &app_state.settings.server.listen_addr;
    let addr: SocketAddr = match listen_addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(
                "Invalid server.listen_addr '{}': {}. Exiting server task.",
                listen_addr_str,
                e
            );
            token.cancel();
            return;
        }
    };

    let app = api::router(app_state);

    tracing::info!("HTTP server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind HTTP server: {}", e);
            token.cancel();
            return;
        }
    };

    let shutdown_token = token.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
            tracing::info!("HTTP server shutting down.");
        })
        .await
    {
        tracing::error!("HTTP server error: {}", e);
        token.cancel();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    tracing::info!("Starting Campaign Push Service...");

    let settings = config::Settings::new()?;
    tracing::info!("Configuration loaded successfully");

    let (app_state, ingest_rx) = state::AppState::new(settings)?;
    tracing::info!("Application state initialized");

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    let state_ingest = Arc::clone(&app_state);
    let token_ingest = token.clone();
    tracker.spawn(async move {
        ingest::run(state_ingest, ingest_rx, token_ingest).await;
        tracing::info!("Campaign ingest task finished.");
    });
    tracing::info!("Campaign ingest started");

    let engine_sweeper = Arc::clone(&app_state.engine);
    let token_sweeper = token.clone();
    tracker.spawn(async move {
        engine_sweeper.run_sweeper(token_sweeper).await;
        tracing::info!("Retry sweeper task finished.");
    });
    tracing::info!("Retry sweeper started");

    let state_server = Arc::clone(&app_state);
    let token_server = token.clone();
    tracker.spawn(async move {
        run_server(state_server, token_server).await;
        tracing::info!("HTTP server task finished.");
    });
    tracing::info!("HTTP server started");

    let token_cancelled = token.child_token();
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = token_cancelled.cancelled() => {
            tracing::info!("Shutdown triggered by task failure");
        }
    }

    tracing::info!("Shutting down services...");

    token.cancel();
    tracker.close();
    tracker.wait().await;

    tracing::info!("Shutdown complete.");
    Ok(())
}
