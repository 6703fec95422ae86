//! Model loading endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use kiln_core::{RuntimeConfig, ServerRuntime};
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::model::{LoadResult, ModelOptions};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(load_model), components(schemas(ModelOptions, LoadResult)))]
pub struct ModelApi;

/// Register model-management routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/load_model", post(load_model))
}

/// Load a model and start the slot scheduler over it.
///
/// A second call replaces the running scheduler; in-flight tasks on the old
/// runtime are abandoned.
#[utoipa::path(
    post,
    path = "/load_model",
    tag = "model",
    request_body = ModelOptions,
    responses(
        (status = 200, description = "Model loaded", body = LoadResult),
        (status = 500, description = "Load failed", body = LoadResult),
    )
)]
pub async fn load_model(
    State(state): State<Arc<AppState>>,
    Json(options): Json<ModelOptions>,
) -> Result<Json<LoadResult>, ServerError> {
    info!(
        model = %options.model_file,
        context_size = options.context_size,
        n_parallel = state.config.n_parallel,
        "loading model"
    );

    let engine = state.loader.load(&options)?;

    let config = RuntimeConfig {
        n_parallel: state.config.n_parallel,
        n_batch: if options.n_batch > 0 {
            options.n_batch as usize
        } else {
            512
        },
        n_predict: -1,
        model_alias: options.model_file.clone(),
        embeddings: options.embeddings,
    };
    let handle = ServerRuntime::launch(engine, config)?;

    let mut guard = state.runtime.write().await;
    if let Some(previous) = guard.take() {
        previous.shutdown();
    }
    *guard = Some(handle);

    info!(model = %options.model_file, "model loaded");
    Ok(Json(LoadResult {
        success: true,
        message: "Loading succeeded".into(),
    }))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
