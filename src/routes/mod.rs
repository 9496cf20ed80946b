//! Router assembly: HTTP endpoints, rate limiting, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod limits;

/// Build the application router with:
/// - REST-ish API under `/api/v1/...`
/// - sliding-window rate limiting by path category (health and monitoring exempt)
/// - CORS (allow any origin/method/headers) – adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::http_health))
        .route("/api/v1/monitoring/cache", get(http::http_monitoring_cache))
        .route("/api/v1/scenarios/:id", get(http::http_get_scenario))
        .route("/api/v1/programs", post(http::http_start_program))
        .route("/api/v1/programs/:id", get(http::http_get_program))
        .route("/api/v1/programs/:id/complete", post(http::http_complete_program))
        .route("/api/v1/programs/:id/abandon", post(http::http_abandon_program))
        .route("/api/v1/programs/:id/feedback", post(http::http_program_feedback))
        .route("/api/v1/tasks/:id/start", post(http::http_start_task))
        .route("/api/v1/tasks/:id/complete", post(http::http_complete_task))
        .route("/api/v1/tasks/:id/reevaluate", post(http::http_reevaluate_task))
        .route("/api/v1/admin/programs/:id/reconcile", post(http::http_admin_reconcile))
        .route("/api/v1/admin/cache/clear", post(http::http_admin_clear_cache))
        .route_layer(middleware::from_fn_with_state(state.clone(), limits::enforce_rate_limit))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
