use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors mapped onto HTTP responses by the route layer.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no model loaded")]
    ModelNotLoaded,

    #[error("failed loading model: {0}")]
    ModelLoad(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Core(#[from] kiln_core::CoreError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::ModelLoad(_) | ServerError::Backend(_) | ServerError::Core(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // model-load failures keep the LoadModel result shape so callers can
        // retry off the same response type
        let body = match &self {
            ServerError::ModelLoad(message) => json!({
                "success": false,
                "message": format!("Failed loading model: {message}"),
            }),
            other => json!({ "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
