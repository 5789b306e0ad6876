//! Deploy Service
//!
//! REST API for deploying repositories as static sites + request-time
//! artifact serving

use anyhow::{Context, Result};
use deploy_service::{create_router, AppState, Config, GitFetcher, RecordStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deploy_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting Deploy Service");
    info!("Deployments directory: {}", config.deploy_dir.display());
    info!("Record store: {}", config.store_path.display());
    info!("Base URL: {}", config.base_url);

    config
        .ensure_directories()
        .context("Failed to prepare directories")?;

    // Initialize storage
    let store = Arc::new(RecordStore::open(&config.store_path).context("Failed to open store")?);

    let fetcher = Arc::new(GitFetcher::new(Duration::from_secs(config.clone_timeout_secs)));

    // Create application state
    let state = Arc::new(AppState::new(&config, store, fetcher));

    // Build any deployments that were fetched but never built, without
    // blocking startup
    let sweep_state = state.clone();
    tokio::spawn(async move {
        sweep_state.pipeline.sweep_unbuilt().await;
    });

    let addr = config.api_address();
    let app = create_router(state);

    // Bind and serve
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Deploy Service running on http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
