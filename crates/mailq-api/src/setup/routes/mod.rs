//! Route configuration and setup.

mod health;

use crate::api_doc::ApiDoc;
use crate::error;
use crate::handlers;
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Json, Router,
};
use mailq_core::Config;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

/// Build the router with intake, operator, health and documentation routes.
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Router<()> {
    let http_concurrency_limit = config.base.http_concurrency_limit.max(1);
    tracing::info!(
        http_concurrency_limit,
        max_body_bytes = config.base.max_body_bytes,
        "HTTP limits configured"
    );

    Router::new()
        .route("/send", post(handlers::send::send_mail))
        .route("/tasks/stats", get(handlers::tasks::task_stats))
        .route("/tasks/{id}", get(handlers::tasks::get_task))
        .route("/tasks/{id}/retry", post(handlers::tasks::retry_task))
        .route("/health", get(health::liveness_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/api/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            error::error_details_middleware,
        ))
        .layer(ConcurrencyLimitLayer::new(http_concurrency_limit))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.base.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
