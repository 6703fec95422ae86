//! Completion endpoints: unary, streaming and embedding.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures::Stream;
use kiln_core::{ResultPayload, ServerHandle, TaskId};
use tracing::debug;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::predict::{EmbeddingResult, PredictOptions, Reply};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(predict, predict_stream, embedding),
    components(schemas(PredictOptions, Reply, EmbeddingResult))
)]
pub struct PredictApi;

/// Register prediction routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/predict", post(predict))
        .route("/predict_stream", post(predict_stream))
        .route("/embedding", post(embedding))
}

async fn require_handle(state: &AppState) -> Result<ServerHandle, ServerError> {
    state.handle().await.ok_or(ServerError::ModelNotLoaded)
}

/// Run one completion to the end and return the concatenated text.
#[utoipa::path(
    post,
    path = "/predict",
    tag = "predict",
    request_body = PredictOptions,
    responses(
        (status = 200, description = "Completion finished", body = Reply),
        (status = 503, description = "No model loaded"),
    )
)]
pub async fn predict(
    State(state): State<Arc<AppState>>,
    Json(options): Json<PredictOptions>,
) -> Result<Json<Reply>, ServerError> {
    let handle = require_handle(&state).await?;
    let task_id = handle.request_completion(options.to_request(false), false, false);
    debug!(task = task_id, "completion queued");

    loop {
        let result = handle.next_result(task_id).await;
        if result.error {
            return Err(ServerError::Backend(result.content().to_string()));
        }
        if result.stop {
            return Ok(Json(Reply {
                message: result.content().to_string(),
            }));
        }
    }
}

/// Stream one completion as server-sent `Reply` events, one per flushed
/// chunk.  Dropping the connection cancels the task at the next scheduler
/// tick.
#[utoipa::path(
    post,
    path = "/predict_stream",
    tag = "predict",
    request_body = PredictOptions,
    responses(
        (status = 200, description = "SSE stream of Reply messages"),
        (status = 503, description = "No model loaded"),
    )
)]
pub async fn predict_stream(
    State(state): State<Arc<AppState>>,
    Json(options): Json<PredictOptions>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let handle = require_handle(&state).await?;
    let task_id = handle.request_completion(options.to_request(true), false, false);
    debug!(task = task_id, "streaming completion queued");

    let guard = CancelGuard {
        handle: handle.clone(),
        task_id,
        armed: true,
    };

    let stream = futures::stream::unfold(
        (handle, task_id, guard, false),
        |(handle, task_id, mut guard, done)| async move {
            if done {
                return None;
            }
            let result = handle.next_result(task_id).await;
            if result.error {
                // surface nothing further; the stream just ends
                guard.armed = false;
                return None;
            }
            let reply = Reply {
                message: result.content().to_string(),
            };
            if result.stop {
                guard.armed = false;
            }
            let data = serde_json::to_string(&reply).unwrap_or_else(|_| reply.message.clone());
            Some((
                Ok::<Event, Infallible>(Event::default().data(data)),
                (handle, task_id, guard, result.stop),
            ))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Compute the pooled embedding of a prompt.
#[utoipa::path(
    post,
    path = "/embedding",
    tag = "predict",
    request_body = PredictOptions,
    responses(
        (status = 200, description = "Embedding computed", body = EmbeddingResult),
        (status = 503, description = "No model loaded"),
    )
)]
pub async fn embedding(
    State(state): State<Arc<AppState>>,
    Json(options): Json<PredictOptions>,
) -> Result<Json<EmbeddingResult>, ServerError> {
    let handle = require_handle(&state).await?;
    let task_id = handle.request_completion(options.to_request(false), false, true);

    loop {
        let result = handle.next_result(task_id).await;
        if result.error {
            return Err(ServerError::Backend(result.content().to_string()));
        }
        if let ResultPayload::Embedding(embedding) = result.payload {
            return Ok(Json(EmbeddingResult { embedding }));
        }
        if result.stop {
            return Err(ServerError::Backend("no embedding in final result".into()));
        }
    }
}

/// Cancels the task when a streaming response is dropped mid-flight.
struct CancelGuard {
    handle: ServerHandle,
    task_id: TaskId,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(task = self.task_id, "stream dropped, cancelling task");
            self.handle.request_cancel(self.task_id);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
