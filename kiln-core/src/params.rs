use serde::{Deserialize, Serialize};

use kiln_llama::LlamaToken;

/// Per-task generation parameters bound to a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotParams {
    /// Emit partial results as tokens are flushed.
    pub stream: bool,
    /// Remember the prompt to avoid reprocessing the shared prefix.
    pub cache_prompt: bool,
    /// Number of tokens pinned at the start of the context (-1 = whole
    /// prompt).
    pub n_keep: i32,
    /// New tokens to predict (-1 = unlimited).
    pub n_predict: i32,
    /// Stop strings.
    pub antiprompt: Vec<String>,
    /// Infill prefix text.
    pub input_prefix: String,
    /// Infill suffix text; also holds the trailing text segment of a
    /// multimodal prompt.
    pub input_suffix: String,
}

impl Default for SlotParams {
    fn default() -> Self {
        Self {
            stream: false,
            cache_prompt: false,
            n_keep: 0,
            n_predict: -1,
            antiprompt: Vec::new(),
            input_prefix: String::new(),
            input_suffix: String::new(),
        }
    }
}

/// A prompt: plain text, or a sequence of text and raw token-id segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Segments(Vec<PromptSegment>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptSegment {
    Token(LlamaToken),
    Text(String),
}

impl Default for PromptInput {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl PromptInput {
    pub fn is_empty_text(&self) -> bool {
        matches!(self, Self::Text(text) if text.is_empty())
    }
}
