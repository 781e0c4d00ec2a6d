//! API route definitions

use crate::runtime::ModelCache;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ModelCache>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/events", get(handlers::events))
        // Repository downloads; ids are percent-encoded ("org%2Fname")
        .route("/downloads", get(handlers::list_downloads))
        .route(
            "/downloads/{kind}/{id}",
            get(handlers::get_download).delete(handlers::remove_download),
        )
        .route("/downloads/{kind}/{id}/start", post(handlers::start_download))
        .route("/downloads/{kind}/{id}/pause", post(handlers::pause_download))
        .route("/downloads/{kind}/{id}/path", get(handlers::downloaded_path))
        .route(
            "/downloads/{kind}/{id}/check-update",
            post(handlers::check_update),
        )
        // Cache maintenance
        .route("/validate", post(handlers::validate))
        .route("/reset", post(handlers::reset))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
