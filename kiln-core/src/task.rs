use serde::Serialize;
use serde_json::Value;

use kiln_llama::SamplingParams;

use crate::image::ImageData;
use crate::params::{PromptInput, SlotParams};

/// Correlation id shared between a task and its results.
pub type TaskId = u64;

/// Everything an RPC handler submits for one completion.
pub struct CompletionRequest {
    pub prompt: PromptInput,
    /// Requested slot (-1 = any).
    pub slot_id: i32,
    pub params: SlotParams,
    pub sampling: SamplingParams,
    /// Suppress EOS by biasing it to `-inf`.
    pub ignore_eos: bool,
    /// Images referenced by `[img-<id>]` markers in the prompt.
    pub images: Vec<ImageData>,
    /// Optional shared-prefix update processed before the task binds.
    pub system_prompt: Option<SystemPromptUpdate>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            prompt: PromptInput::default(),
            slot_id: -1,
            params: SlotParams::default(),
            sampling: SamplingParams::default(),
            ignore_eos: false,
            images: Vec::new(),
            system_prompt: None,
        }
    }
}

/// Shared system prompt plus the chat names attached to it.
#[derive(Debug, Clone, Default)]
pub struct SystemPromptUpdate {
    pub prompt: String,
    pub anti_prompt: String,
    pub assistant_name: String,
}

/// A unit of work consumed by the scheduler at tick start.
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
}

pub enum TaskKind {
    Completion {
        request: Box<CompletionRequest>,
        infill: bool,
        embedding: bool,
    },
    Cancel {
        target_id: TaskId,
    },
}

/// One message delivered back to the RPC handler that owns `id`.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: TaskId,
    /// Final result for the task; no further results follow.
    pub stop: bool,
    pub error: bool,
    pub payload: ResultPayload,
}

#[derive(Debug, Clone)]
pub enum ResultPayload {
    Partial(PartialPayload),
    Final(Box<FinalPayload>),
    Embedding(Vec<f32>),
    Error(String),
}

impl TaskResult {
    pub fn content(&self) -> &str {
        match &self.payload {
            ResultPayload::Partial(partial) => &partial.content,
            ResultPayload::Final(fin) => &fin.content,
            ResultPayload::Embedding(_) => "",
            ResultPayload::Error(message) => message,
        }
    }
}

/// A flushed chunk of one streaming completion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartialPayload {
    pub content: String,
    pub slot_id: usize,
    pub multimodal: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub completion_probabilities: Vec<TokenProbs>,
}

/// The terminal record of one completion.
#[derive(Debug, Clone, Serialize)]
pub struct FinalPayload {
    pub content: String,
    pub slot_id: usize,
    pub model: String,
    pub tokens_predicted: usize,
    pub tokens_evaluated: usize,
    pub truncated: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    pub stopping_word: String,
    pub tokens_cached: usize,
    pub timings: Timings,
    pub generation_settings: Value,
    pub prompt: PromptInput,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub completion_probabilities: Vec<TokenProbs>,
}

/// Prompt-processing and generation speed of one completion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub prompt_per_token_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub predicted_per_token_ms: f64,
    pub predicted_per_second: f64,
}

/// Candidate probabilities reported for one generated token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenProbs {
    pub content: String,
    pub probs: Vec<TokenProb>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenProb {
    pub tok_str: String,
    pub prob: f32,
}
