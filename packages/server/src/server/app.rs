//! Application setup and router configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::ServerDeps;
use crate::server::middleware::internal_secret_middleware;
use crate::server::routes::{
    create_job_handler, health_handler, job_status_handler, job_stream_handler,
};

/// Shared application state.
#[derive(Clone)]
pub struct AxumAppState {
    pub deps: Arc<ServerDeps>,
}

/// Build the Axum application router.
///
/// Background services (queue runner, cron driver) are spawned by the
/// binary, not here, so tests can drive the router against in-memory deps.
pub fn build_app(deps: Arc<ServerDeps>, internal_api_secret: Option<String>) -> Router {
    let state = AxumAppState { deps };

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/api/jobs/create", post(create_job_handler))
        .route("/api/jobs/:job_id/status", get(job_status_handler))
        .route("/api/jobs/:job_id/stream", get(job_stream_handler))
        // Health check (outside /api, no secret required)
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(middleware::from_fn(move |req, next| {
            internal_secret_middleware(internal_api_secret.clone(), req, next)
        }))
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
