//! Continuous-batching slot scheduler for the kiln inference server.
//!
//! A fixed pool of slots shares one decoder context; a single scheduler
//! thread advances every active stream through one token-level decode loop
//! per tick.  RPC handlers talk to it through two mailboxes only: they queue
//! [`CompletionRequest`]s and poll [`TaskResult`]s by task id.
//!
//! ```rust
//! use kiln_core::{CompletionRequest, PromptInput, RuntimeConfig, ServerRuntime, SlotParams};
//! use kiln_llama::mock::MockEngine;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = Box::new(MockEngine::new(256).with_script("pong"));
//! let handle = ServerRuntime::launch(engine, RuntimeConfig::default()).unwrap();
//!
//! let request = CompletionRequest {
//!     prompt: PromptInput::Text("hi".into()),
//!     params: SlotParams { n_predict: 8, ..SlotParams::default() },
//!     ..CompletionRequest::default()
//! };
//! let task_id = handle.request_completion(request, false, false);
//! let result = handle.next_result(task_id).await;
//! assert_eq!(result.content(), "pong");
//! handle.shutdown();
//! # }
//! ```

mod image;
mod params;
mod prompt;
mod queue;
mod runtime;
mod scheduler;
mod slot;
mod task;

pub use image::ImageData;
pub use params::{PromptInput, PromptSegment, SlotParams};
pub use runtime::{RuntimeConfig, RuntimeInfo, ServerHandle, ServerRuntime};
pub use task::{
    CompletionRequest, FinalPayload, PartialPayload, ResultPayload, SystemPromptUpdate, TaskId,
    TaskResult, Timings, TokenProb, TokenProbs,
};

/// Errors surfaced by the scheduler core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Llama(#[from] kiln_llama::LlamaError),

    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid image payload: {0}")]
    InvalidImage(String),

    #[error("image with id {0} not found in request")]
    ImageNotFound(i32),

    #[error("failed to spawn scheduler thread")]
    SpawnFailed(#[source] std::io::Error),
}
