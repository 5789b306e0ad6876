//! Deploy Service
//!
//! Turns a source repository into a servable static site: clones it,
//! detects or builds the publishable artifact, enforces the storage quota,
//! and serves the result under a stable per-deployment URL.

pub mod billing;
pub mod build;
pub mod config;
pub mod detect;
pub mod fetch;
pub mod handlers;
pub mod materialize;
pub mod pipeline;
pub mod resolve;
pub mod rewrite;
pub mod store;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use fetch::{GitFetcher, LocalDirFetcher, SourceFetcher};
pub use handlers::AppState;
pub use pipeline::{DeployOutcome, Pipeline, RedeployOutcome, VerifyOutcome};
pub use store::RecordStore;

/// Create the API and static-serving router
pub fn create_router(shared_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/favicon.ico", get(handlers::favicon_handler))
        .route("/api/deploy", post(handlers::deploy_handler))
        .route("/api/sites", get(handlers::list_sites_handler))
        .route("/api/sites/{id}", delete(handlers::delete_site_handler))
        .route("/api/sites/{id}/redeploy", post(handlers::redeploy_handler))
        .route("/api/sites/{id}/logs", get(handlers::logs_handler))
        .route("/api/sites/{id}/build", post(handlers::build_site_handler))
        .route(
            "/api/sites/{id}/build-status",
            get(handlers::build_status_handler),
        )
        .route("/api/payments/verify", post(handlers::verify_payment_handler))
        .route("/sites/{id}", get(handlers::serve_site_index))
        .route("/sites/{id}/{*path}", get(handlers::serve_site_path))
        .route("/", get(handlers::serve_latest_index))
        .route("/{*path}", get(handlers::serve_latest_path))
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
