//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health))]
pub struct HealthApi;

/// Register health-check routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Heartbeat endpoint.
///
/// Returns `{"message": "OK"}` with HTTP 200 while the scheduler is sound.
/// Once the scheduler thread has died on a fatal decode error, reports
/// HTTP 500 so orchestrators can restart the process.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy"),
        (status = 500, description = "The scheduler terminated fatally"),
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Response {
    if let Some(handle) = state.handle().await {
        if handle.is_failed() {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "inference runtime terminated" })),
            )
                .into_response();
        }
    }
    Json(json!({ "message": "OK" })).into_response()
}

// ── Tests ──────────────────────────────────────────────────────────────────────
