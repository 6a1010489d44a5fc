//! HTTP Adapter (C11, ambient): Axum router exposing the routes in §6.
//!
//! Middleware stack, outer to inner: `TraceLayer` (request/response spans),
//! the correlation-id layer, `RequestBodyLimitLayer`, `CorsLayer`, a request
//! timeout (itself preceded by a `HandleErrorLayer` so the `Timeout<S>`
//! service's `BoxError` becomes a `504` response rather than failing to
//! compile against axum's infallible-service bound), then per-route auth
//! (`UserIdentity`) and rate-limit extraction.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::{BoxError, ServiceBuilder};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::engine::WorkflowRegistry;
use crate::engine::template::TemplateRenderer;
use crate::llm::CouncilClient;
use crate::ratelimit::{Policy, RateLimiter};
use crate::storage::ConversationStore;

pub use error::{ApiError, ApiResult};

/// Shared services the HTTP layer hands to every handler.
pub struct AppState {
    pub registry: Arc<WorkflowRegistry>,
    pub storage: Arc<dyn ConversationStore>,
    pub config: Arc<AppConfig>,
    pub llm: Arc<CouncilClient>,
    pub templates: Arc<TemplateRenderer>,
    pub rate_limiter: Arc<RateLimiter>,
}

pub fn rate_limiter_for(config: &AppConfig) -> RateLimiter {
    RateLimiter::new(config.rate_limit_enabled)
        .with_policy(
            Policy::Api,
            config.rate_limit_max_requests,
            Duration::from_millis(config.rate_limit_window_ms),
        )
        .with_policy(
            Policy::WorkflowExecution,
            config.rate_limit_max_workflow_executions,
            Duration::from_millis(config.rate_limit_window_ms),
        )
}

/// Assembles the full router: routes plus the middleware stack described in
/// §4.11. `state` is shared across requests behind an `Arc`.
pub fn router(state: Arc<AppState>) -> Router {
    let max_body = state.config.http_max_request_size_bytes;
    let request_timeout = Duration::from_millis(state.config.http_request_timeout_ms);

    Router::new()
        .route("/", get(handlers::health))
        .route(
            "/api/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route("/api/conversations/:id", get(handlers::get_conversation))
        .route("/api/workflows", get(handlers::list_workflows))
        .route("/api/workflows/:id", get(handlers::get_workflow))
        .route(
            "/api/conversations/:id/execute/stream",
            post(handlers::execute_stream),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::correlation_id))
                .layer(RequestBodyLimitLayer::new(max_body))
                .layer(CorsLayer::permissive())
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

/// Converts the `BoxError` a timed-out inner service produces into the
/// `504` response §6 requires for an expired request deadline.
async fn handle_timeout_error(_err: BoxError) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::GATEWAY_TIMEOUT,
        Json(json!({ "error": "request timed out" })),
    )
}
