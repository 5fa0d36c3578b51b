// API route definitions

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::agents::Orchestrator;
use crate::auth::OAuthManager;
use crate::ingestion::file_processor::MAX_INPUT_BYTES;

use super::handlers;

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub oauth: Arc<OAuthManager>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Receipt processing
        .route("/upload-receipt", post(handlers::upload_receipt))
        .route("/upload-receipt-agents", post(handlers::upload_receipt_agents))
        // OAuth management
        .route("/auth-status", get(handlers::auth_status))
        .route("/auth-url", get(handlers::auth_url))
        .layer(DefaultBodyLimit::max(MAX_INPUT_BYTES + 64 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
