use std::time::{Duration, Instant};

use kiln_llama::{LlamaToken, SamplerChain, SamplingParams};

use crate::image::SlotImage;
use crate::params::{PromptInput, SlotParams};
use crate::task::{TaskId, Timings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Idle,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotCommand {
    None,
    LoadPrompt,
    Release,
}

/// One sampled token together with its reported candidates.
#[derive(Debug, Clone)]
pub(crate) struct CompletionOutput {
    pub tok: LlamaToken,
    pub probs: Vec<(LlamaToken, f32)>,
}

/// One concurrent generation stream.
///
/// `id` doubles as the KV sequence id for this stream; `cache_tokens`
/// mirrors the tokens materialized in that sequence (past the shared system
/// prefix) and backs prefix-reuse diffing.
pub(crate) struct Slot {
    pub id: usize,
    pub task_id: Option<TaskId>,

    pub state: SlotState,
    pub command: SlotCommand,

    pub params: SlotParams,
    pub sampling_params: SamplingParams,
    pub sampler: Option<SamplerChain>,

    pub prompt: PromptInput,

    /// Context budget for this slot (total context / number of slots).
    pub n_ctx: usize,
    pub n_past: usize,
    pub n_decoded: usize,
    pub n_remaining: i64,
    /// Index into the assembled batch where this slot's logits land.
    pub i_batch: Option<usize>,

    pub num_prompt_tokens: usize,
    pub num_prompt_tokens_processed: usize,

    /// Bytes still needed to complete the current UTF-8 codepoint.
    pub multibyte_pending: usize,

    /// Raw generated bytes; only flushed at codepoint boundaries.
    pub generated: Vec<u8>,
    pub sampled: LlamaToken,
    pub cache_tokens: Vec<LlamaToken>,
    pub generated_token_probs: Vec<CompletionOutput>,

    pub infill: bool,
    pub embedding: bool,
    pub has_next_token: bool,
    pub truncated: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    pub stopping_word: String,

    pub images: Vec<SlotImage>,

    /// Watermark of bytes already streamed to the client.
    pub sent_count: usize,
    pub sent_token_probs_index: usize,

    pub t_last_used: Option<Instant>,
    pub t_start_process_prompt: Option<Instant>,
    pub t_start_generation: Option<Instant>,
    pub t_prompt_processing: Duration,
    pub t_token_generation: Duration,
}

impl Slot {
    pub fn new(id: usize, n_ctx: usize) -> Self {
        Self {
            id,
            task_id: None,
            state: SlotState::Idle,
            command: SlotCommand::None,
            params: SlotParams::default(),
            sampling_params: SamplingParams::default(),
            sampler: None,
            prompt: PromptInput::default(),
            n_ctx,
            n_past: 0,
            n_decoded: 0,
            n_remaining: -1,
            i_batch: None,
            num_prompt_tokens: 0,
            num_prompt_tokens_processed: 0,
            multibyte_pending: 0,
            generated: Vec::new(),
            sampled: 0,
            cache_tokens: Vec::new(),
            generated_token_probs: Vec::new(),
            infill: false,
            embedding: false,
            has_next_token: true,
            truncated: false,
            stopped_eos: false,
            stopped_word: false,
            stopped_limit: false,
            stopping_word: String::new(),
            images: Vec::new(),
            sent_count: 0,
            sent_token_probs_index: 0,
            t_last_used: None,
            t_start_process_prompt: None,
            t_start_generation: None,
            t_prompt_processing: Duration::ZERO,
            t_token_generation: Duration::ZERO,
        }
    }

    /// Prepare the slot for a new task.  `cache_tokens` survives so the next
    /// prompt can reuse the materialized prefix.
    pub fn reset(&mut self) {
        self.num_prompt_tokens = 0;
        self.num_prompt_tokens_processed = 0;
        self.generated.clear();
        self.truncated = false;
        self.stopped_eos = false;
        self.stopped_word = false;
        self.stopped_limit = false;
        self.stopping_word.clear();
        self.multibyte_pending = 0;
        self.n_past = 0;
        self.n_decoded = 0;
        self.n_remaining = -1;
        self.sent_count = 0;
        self.sent_token_probs_index = 0;
        self.infill = false;
        self.embedding = false;
        self.has_next_token = true;
        self.i_batch = None;
        self.generated_token_probs.clear();
        self.images.clear();
        self.sampler = None;
        self.t_start_process_prompt = None;
        self.t_start_generation = None;
        self.t_prompt_processing = Duration::ZERO;
        self.t_token_generation = Duration::ZERO;
    }

    pub fn available(&self) -> bool {
        self.state == SlotState::Idle && self.command == SlotCommand::None
    }

    pub fn is_processing(&self) -> bool {
        (self.state == SlotState::Idle && self.command == SlotCommand::LoadPrompt)
            || self.state == SlotState::Processing
    }

    /// Whether this slot may produce another token under its own
    /// `n_predict` or the server-wide one.
    pub fn has_budget(&mut self, global_n_predict: i32) -> bool {
        self.n_remaining = -1;
        if self.params.n_predict != -1 {
            self.n_remaining = self.params.n_predict as i64 - self.n_decoded as i64;
        } else if global_n_predict != -1 {
            self.n_remaining = global_n_predict as i64 - self.n_decoded as i64;
        }
        self.n_remaining > 0 || self.n_remaining == -1
    }

    /// Raise the finish flag; the next tick transitions the slot to idle.
    pub fn release(&mut self) {
        if let Some(start) = self.t_start_generation {
            self.t_token_generation = start.elapsed();
        }
        self.command = SlotCommand::Release;
    }

    /// Record a sampled token's probabilities (skipped once released).
    pub fn add_token(&mut self, output: CompletionOutput) {
        if self.command == SlotCommand::Release {
            return;
        }
        self.generated_token_probs.push(output);
    }

    /// Track how many continuation bytes the current UTF-8 codepoint still
    /// needs after appending `piece`.
    pub fn update_multibyte(&mut self, piece: &[u8]) {
        if self.multibyte_pending > 0 {
            self.multibyte_pending = self.multibyte_pending.saturating_sub(piece.len());
        } else if piece.len() == 1 {
            let byte = piece[0];
            self.multibyte_pending = if byte & 0xE0 == 0xC0 {
                1
            } else if byte & 0xF0 == 0xE0 {
                2
            } else if byte & 0xF8 == 0xF0 {
                3
            } else {
                0
            };
        }
    }

    /// Earliest full stop-string match in `tail`; flags the slot stopped.
    ///
    /// Only the window reachable by the last token is searched, so matches
    /// settled in earlier flushes are not rediscovered.
    pub fn find_stop_full(&mut self, tail: &[u8], last_token_len: usize) -> Option<usize> {
        let mut stop_pos: Option<usize> = None;
        let mut matched_word: Option<&str> = None;
        for word in &self.params.antiprompt {
            let needle = word.as_bytes();
            if needle.is_empty() {
                continue;
            }
            let window = needle.len() + last_token_len;
            let from = tail.len().saturating_sub(window);
            if let Some(pos) = find_subslice(tail, needle, from) {
                if stop_pos.is_none_or(|cur| pos < cur) {
                    stop_pos = Some(pos);
                    matched_word = Some(word);
                }
            }
        }
        if let (Some(_), Some(word)) = (stop_pos, matched_word) {
            self.stopped_word = true;
            self.stopping_word = word.to_string();
            self.has_next_token = false;
        }
        stop_pos
    }

    /// Earliest position where a suffix of `tail` is a prefix of some stop
    /// string.  Bytes from there on may still grow into a full match and
    /// must not be flushed.
    pub fn find_stop_partial(&self, tail: &[u8]) -> Option<usize> {
        self.params
            .antiprompt
            .iter()
            .filter_map(|word| find_partial_stop(word.as_bytes(), tail))
            .min()
    }

    pub fn timings(&self) -> Timings {
        let prompt_n = self.num_prompt_tokens_processed;
        let prompt_ms = self.t_prompt_processing.as_secs_f64() * 1e3;
        let predicted_n = self.n_decoded;
        let predicted_ms = self.t_token_generation.as_secs_f64() * 1e3;
        Timings {
            prompt_n,
            prompt_ms,
            prompt_per_token_ms: prompt_ms / prompt_n as f64,
            prompt_per_second: 1e3 / prompt_ms * prompt_n as f64,
            predicted_n,
            predicted_ms,
            predicted_per_token_ms: predicted_ms / predicted_n as f64,
            predicted_per_second: 1e3 / predicted_ms * predicted_n as f64,
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Longest suffix of `text` that is a proper prefix of `stop`, returned as
/// its start offset in `text`.
pub(crate) fn find_partial_stop(stop: &[u8], text: &[u8]) -> Option<usize> {
    let last = *text.last()?;
    for char_index in (0..stop.len()).rev() {
        if stop[char_index] == last {
            let partial = &stop[..char_index + 1];
            if text.ends_with(partial) {
                return Some(text.len() - char_index - 1);
            }
        }
    }
    None
}

// ── Tests ──────────────────────────────────────────────────────────────────────
