use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers::{muster, AppState};
use crate::services::request_handler::RequestHandler;

/// Create router with application state
pub fn create_router_with_state(handler: Arc<RequestHandler>) -> Router {
    let state = AppState { handler };

    Router::new()
        .route("/health", get(health_check))
        .route("/muster", get(muster::muster))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
