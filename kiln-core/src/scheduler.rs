//! The single-threaded tick loop driving every slot through the shared
//! decoder.
//!
//! One tick: drain tasks, refresh the system prompt, shift slots out of
//! context pressure, append continuation tokens, ingest freshly bound
//! prompts, then decode the assembled batch in `n_batch` chunks and sample
//! every slot whose logits landed in the decoded chunk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_llama::{
    LlamaBatch, LlamaEngine, LlamaError, LlamaPos, LlamaSeqId, LlamaToken, SamplerChain,
};
use serde_json::json;

use crate::image::SlotImage;
use crate::params::PromptInput;
use crate::prompt;
use crate::queue::TaskHub;
use crate::runtime::RuntimeConfig;
use crate::slot::{CompletionOutput, Slot, SlotCommand, SlotState};
use crate::task::{
    CompletionRequest, FinalPayload, PartialPayload, ResultPayload, SystemPromptUpdate, TaskId,
    TaskKind, TaskResult, TokenProb, TokenProbs,
};
use crate::CoreError;

/// Cache-token stand-in for one image-embedding row resident in the KV
/// cache; never a real vocabulary id.
const IMAGE_EMBEDDING_CELL: LlamaToken = -1;

/// Shared system prefix decoded into sequence 0 and copied to every slot.
#[derive(Default)]
struct SystemPrompt {
    prompt: String,
    tokens: Vec<i32>,
    need_update: bool,
    anti_prompt: String,
    assistant_name: String,
}

pub(crate) struct Scheduler {
    engine: Box<dyn LlamaEngine>,
    config: RuntimeConfig,
    slots: Vec<Slot>,
    batch: LlamaBatch,
    system: SystemPrompt,
    hub: Arc<TaskHub>,
    multimodal: bool,
    all_slots_idle: bool,
    clean_kv_cache: bool,
}

impl Scheduler {
    pub fn new(engine: Box<dyn LlamaEngine>, config: RuntimeConfig, hub: Arc<TaskHub>) -> Self {
        let n_ctx = engine.n_ctx() as usize;
        let n_ctx_slot = n_ctx / config.n_parallel;
        let multimodal = engine.image_encoder().is_some();

        let slots = (0..config.n_parallel)
            .map(|id| {
                tracing::info!(slot = id, n_ctx = n_ctx_slot, "slot created");
                Slot::new(id, n_ctx_slot)
            })
            .collect();

        Self {
            engine,
            config,
            slots,
            batch: LlamaBatch::new(n_ctx),
            system: SystemPrompt::default(),
            hub,
            multimodal,
            all_slots_idle: true,
            clean_kv_cache: true,
        }
    }

    /// Tick until shutdown; a fatal tick error answers all in-flight tasks
    /// and marks the runtime failed.
    pub fn run(&mut self) {
        loop {
            if self.hub.is_shutdown() {
                tracing::info!("scheduler shutting down");
                return;
            }
            if let Err(err) = self.update_slots() {
                tracing::error!(error = %err, "fatal scheduler error, stopping");
                self.fail_all(&err);
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn fail_all(&mut self, err: &CoreError) {
        for slot in &mut self.slots {
            if let Some(task_id) = slot.task_id.take() {
                if slot.is_processing() {
                    self.hub.push_result(TaskResult {
                        id: task_id,
                        stop: true,
                        error: true,
                        payload: ResultPayload::Error(err.to_string()),
                    });
                }
            }
        }
        self.hub.set_failed();
    }

    // ── Task intake ──────────────────────────────────────────────────────────

    fn process_tasks(&mut self) {
        for task in self.hub.drain_tasks() {
            match task.kind {
                TaskKind::Completion {
                    request,
                    infill,
                    embedding,
                } => self.bind_completion(task.id, *request, infill, embedding),
                TaskKind::Cancel { target_id } => self.cancel_task(target_id),
            }
        }
    }

    fn bind_completion(
        &mut self,
        task_id: TaskId,
        request: CompletionRequest,
        infill: bool,
        embedding: bool,
    ) {
        let Some(index) = self.get_slot(request.slot_id) else {
            tracing::warn!(task = task_id, "slot unavailable");
            self.send_error(task_id, "slot unavailable");
            return;
        };

        if let Some(update) = &request.system_prompt {
            self.process_system_prompt_data(update.clone());
        }

        {
            let slot = &mut self.slots[index];
            slot.reset();
            slot.infill = infill;
            slot.embedding = embedding;
            slot.task_id = Some(task_id);
        }

        if let Err(err) = self.launch_slot(index, request) {
            tracing::warn!(slot = index, task = task_id, error = %err, "failed to launch slot");
            self.slots[index].task_id = None;
            self.send_error(task_id, &err.to_string());
        }
    }

    fn cancel_task(&mut self, target_id: TaskId) {
        for slot in &mut self.slots {
            if slot.task_id == Some(target_id) {
                slot.release();
                break;
            }
        }
    }

    /// Pick the requested slot when it is free, the least-recently-used
    /// available slot otherwise.
    fn get_slot(&self, requested_id: i32) -> Option<usize> {
        if requested_id >= 0 {
            let index = requested_id as usize;
            if self.slots.get(index).is_some_and(Slot::available) {
                return Some(index);
            }
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.available())
            .min_by_key(|(_, slot)| slot.t_last_used)
            .map(|(index, _)| index)
    }

    fn launch_slot(&mut self, index: usize, request: CompletionRequest) -> Result<(), CoreError> {
        let eos = self.engine.token_eos();

        let mut sampling = request.sampling;
        if request.ignore_eos {
            sampling.logit_bias.insert(eos, f32::NEG_INFINITY);
        }

        let slot = &mut self.slots[index];
        slot.params = request.params;
        slot.prompt = request.prompt;
        slot.sampling_params = sampling.clone();
        slot.sampler = Some(SamplerChain::new(sampling));

        if !request.images.is_empty() {
            if !self.multimodal {
                tracing::warn!(slot = index, "image data ignored: model is not multimodal");
            } else {
                for img in &request.images {
                    let image = SlotImage::from_request(img)?;
                    tracing::info!(
                        slot = index,
                        image = image.id,
                        width = image.width,
                        height = image.height,
                        "image loaded"
                    );
                    self.slots[index].images.push(image);
                }

                let slot = &mut self.slots[index];
                if let PromptInput::Text(text) = slot.prompt.clone() {
                    let tail = prompt::bind_image_prefixes(&text, &mut slot.images)?;
                    slot.prompt = PromptInput::Text(String::new());
                    slot.params.input_suffix = tail;
                    // prefix reuse cannot span spliced image embeddings
                    slot.params.cache_prompt = false;
                }
            }
        }

        self.slots[index].command = SlotCommand::LoadPrompt;
        self.all_slots_idle = false;

        tracing::info!(
            slot = index,
            task = ?self.slots[index].task_id,
            "slot is processing"
        );
        Ok(())
    }

    // ── System prompt ────────────────────────────────────────────────────────

    fn process_system_prompt_data(&mut self, update: SystemPromptUpdate) {
        self.system.prompt = update.prompt;
        self.system.anti_prompt = update.anti_prompt;
        self.system.assistant_name = update.assistant_name;

        tracing::info!(
            anti_prompt = %self.system.anti_prompt,
            assistant_name = %self.system.assistant_name,
            "system prompt changed"
        );

        if !self.slots.is_empty() {
            for slot in &mut self.slots {
                slot.release();
            }
            self.system.need_update = true;
        }
    }

    fn update_system_prompt(&mut self) -> Result<(), CoreError> {
        self.system.tokens = self.engine.tokenize(&self.system.prompt, true, true)?;

        self.batch.clear();
        self.kv_cache_clear();

        for (i, &token) in self.system.tokens.iter().enumerate() {
            self.batch.add(token, i as LlamaPos, &[0], false)?;
        }
        self.decode_batch_plain()?;

        for i in 1..self.config.n_parallel {
            self.engine
                .kv_seq_cp(0, i as LlamaSeqId, 0, self.system.tokens.len() as LlamaPos);
        }

        tracing::info!(tokens = self.system.tokens.len(), "system prompt updated");
        self.system.need_update = false;
        self.batch.clear();
        Ok(())
    }

    /// Decode the current batch in `n_batch` chunks without sampling.
    fn decode_batch_plain(&mut self) -> Result<(), CoreError> {
        let total = self.batch.n_tokens();
        let n_batch = self.config.n_batch;
        let mut i = 0;
        while i < total {
            let n_tokens = n_batch.min(total - i);
            let view = self.batch.view(i, n_tokens);
            self.engine.decode(&view)?;
            i += n_tokens;
        }
        Ok(())
    }

    fn kv_cache_clear(&mut self) {
        self.engine.kv_clear();
        self.clean_kv_cache = false;
    }

    // ── The tick ─────────────────────────────────────────────────────────────

    pub fn update_slots(&mut self) -> Result<(), CoreError> {
        self.process_tasks();

        if self.system.need_update && self.all_slots_idle {
            self.update_system_prompt()?;
        }

        self.batch.clear();

        if self.all_slots_idle {
            if self.system.prompt.is_empty() && self.clean_kv_cache {
                tracing::debug!("all slots idle, clearing the KV cache");
                self.kv_cache_clear();
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        self.shift_contexts();
        self.release_and_continue()?;
        self.ingest_pending_prompts()?;

        if self.batch.is_empty() {
            self.all_slots_idle = true;
            return Ok(());
        }

        self.decode_and_sample()
    }

    /// Evict the middle of any slot whose cache reached its context budget,
    /// keeping the pinned `n_keep` head.
    fn shift_contexts(&mut self) {
        for slot in &mut self.slots {
            if !slot.is_processing() || slot.n_past < slot.n_ctx {
                continue;
            }

            let n_keep = slot.params.n_keep.max(0) as usize;
            let n_left = slot.n_past.saturating_sub(n_keep + 1);
            let n_discard = n_left / 2;
            if n_discard == 0 {
                continue;
            }

            tracing::info!(
                slot = slot.id,
                n_keep,
                n_left,
                n_discard,
                "context shift"
            );

            let seq = slot.id as LlamaSeqId;
            self.engine.kv_seq_rm(
                seq,
                (n_keep + 1) as LlamaPos,
                (n_keep + n_discard + 1) as LlamaPos,
            );
            self.engine.kv_seq_shift(
                seq,
                (n_keep + 1 + n_discard) as LlamaPos,
                slot.n_past as LlamaPos,
                -(n_discard as LlamaPos),
            );

            slot.cache_tokens.drain(n_keep + 1..n_keep + 1 + n_discard);
            slot.n_past -= n_discard;
            slot.truncated = true;
        }
    }

    /// Flip released slots back to idle and append one continuation token
    /// per processing slot.
    fn release_and_continue(&mut self) -> Result<(), CoreError> {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];

            if slot.command == SlotCommand::Release {
                slot.state = SlotState::Idle;
                slot.command = SlotCommand::None;
                slot.t_last_used = Some(Instant::now());
                tracing::info!(
                    slot = slot.id,
                    cache_tokens = slot.cache_tokens.len(),
                    "slot released"
                );
                continue;
            }

            if slot.state == SlotState::Idle {
                continue;
            }

            slot.i_batch = Some(self.batch.n_tokens());
            self.batch.add(
                slot.sampled,
                (self.system.tokens.len() + slot.n_past) as LlamaPos,
                &[slot.id as LlamaSeqId],
                true,
            )?;
            slot.cache_tokens.push(slot.sampled);
            slot.n_decoded += 1;
            slot.n_past += 1;
        }
        Ok(())
    }

    fn ingest_pending_prompts(&mut self) -> Result<(), CoreError> {
        for index in 0..self.slots.len() {
            let loading = {
                let slot = &self.slots[index];
                slot.state == SlotState::Idle && slot.command == SlotCommand::LoadPrompt
            };
            if !loading {
                continue;
            }

            let has_prompt = {
                let slot = &self.slots[index];
                !slot.prompt.is_empty_text()
                    || !slot.images.is_empty()
                    || (slot.infill
                        && !(slot.params.input_prefix.is_empty()
                            && slot.params.input_suffix.is_empty()))
            };
            if !has_prompt {
                // empty prompt: answer immediately with an empty final result
                self.slots[index].release();
                self.send_final_response(index);
                continue;
            }

            self.ingest_slot_prompt(index)?;
        }
        Ok(())
    }

    fn ingest_slot_prompt(&mut self, index: usize) -> Result<(), CoreError> {
        let system_len = self.system.tokens.len();

        {
            let slot = &mut self.slots[index];
            slot.state = SlotState::Processing;
            slot.command = SlotCommand::None;
            slot.t_start_process_prompt = Some(Instant::now());
            slot.t_start_generation = None;
        }

        let mut prompt_tokens = {
            let engine = &*self.engine;
            let slot = &self.slots[index];
            if slot.infill {
                prompt::build_infill_prompt(
                    engine,
                    &slot.params.input_prefix,
                    &slot.params.input_suffix,
                )?
            } else {
                prompt::tokenize_prompt(engine, &slot.prompt, self.system.prompt.is_empty())?
            }
        };

        if prompt_tokens.is_empty() && self.slots[index].images.is_empty() {
            self.slots[index].release();
            self.send_final_response(index);
            return Ok(());
        }

        self.slots[index].num_prompt_tokens = prompt_tokens.len();

        if !self.slots[index].params.cache_prompt {
            let slot = &mut self.slots[index];
            if let Some(sampler) = slot.sampler.as_mut() {
                sampler.reset();
            }
            slot.n_past = 0;
            slot.num_prompt_tokens_processed = slot.num_prompt_tokens;
        } else {
            let slot = &mut self.slots[index];
            if slot.params.n_keep < 0 {
                slot.params.n_keep = slot.num_prompt_tokens as i32;
            }
            slot.params.n_keep = slot.params.n_keep.min(slot.n_ctx as i32 - 4);

            if slot.num_prompt_tokens >= slot.n_ctx {
                prompt_tokens = prompt::truncate_middle(
                    &prompt_tokens,
                    slot.params.n_keep.max(0) as usize,
                    slot.n_ctx,
                );
                slot.truncated = true;
                slot.num_prompt_tokens = prompt_tokens.len();
                debug_assert!(slot.num_prompt_tokens < slot.n_ctx);
            }

            slot.n_past = prompt::common_prefix(&slot.cache_tokens, &prompt_tokens);
            if slot.n_past == 0 {
                // nothing reusable: sampling state must not leak from the
                // previous tenant of this slot
                if let Some(sampler) = slot.sampler.as_mut() {
                    sampler.reset();
                }
            }
            slot.num_prompt_tokens_processed = slot.num_prompt_tokens - slot.n_past;

            tracing::info!(
                slot = slot.id,
                cached = slot.n_past,
                to_process = slot.num_prompt_tokens_processed,
                "prompt prefix diff"
            );
        }

        // ingest the prompt into the sampling context (no grammar yet)
        if let Some(sampler) = self.slots[index].sampler.as_mut() {
            for &token in &prompt_tokens {
                sampler.accept(token, false);
            }
        }

        // drop the stale suffix of this slot's sequence
        {
            let p0 = (system_len + self.slots[index].n_past) as LlamaPos;
            let seq = self.slots[index].id as LlamaSeqId;
            tracing::debug!(slot = index, from = p0, "kv cache rm");
            self.engine.kv_seq_rm(seq, p0, -1);
        }

        {
            let slot = &mut self.slots[index];
            slot.cache_tokens = prompt_tokens;
            if slot.n_past == slot.num_prompt_tokens && slot.n_past > 0 {
                // re-evaluate at least one token so this round produces logits
                slot.n_past -= 1;
            }
        }

        let has_images = self.process_images(index)?;

        let prefix_tokens = if has_images {
            let prefix = self.slots[index].images[0].prefix_prompt.clone();
            let tokens = self.engine.tokenize(&prefix, true, true)?;
            // the cache mirrors what actually enters the sequence, not the
            // blanked prompt
            self.slots[index].cache_tokens = tokens.clone();
            tokens
        } else {
            self.slots[index].cache_tokens.clone()
        };

        {
            let slot = &mut self.slots[index];
            while slot.n_past < prefix_tokens.len() {
                self.batch.add(
                    prefix_tokens[slot.n_past],
                    (system_len + slot.n_past) as LlamaPos,
                    &[slot.id as LlamaSeqId],
                    false,
                )?;
                slot.n_past += 1;
            }
        }

        if has_images {
            self.ingest_images(index)?;
        }

        if !self.batch.is_empty() {
            let last = self.batch.n_tokens() - 1;
            self.batch.set_logits(last, true);
        }

        let slot = &mut self.slots[index];
        slot.n_decoded = 0;
        slot.i_batch = if self.batch.is_empty() {
            None
        } else {
            Some(self.batch.n_tokens() - 1)
        };
        Ok(())
    }

    // ── Multimodal ───────────────────────────────────────────────────────────

    /// Encode any pending images for the slot.  Returns whether the slot
    /// carries images at all.
    fn process_images(&mut self, index: usize) -> Result<bool, CoreError> {
        if self.slots[index].images.is_empty() {
            return Ok(false);
        }
        let encoder = self
            .engine
            .image_encoder()
            .ok_or(CoreError::Llama(LlamaError::NoImageEncoder))?;

        let slot = &mut self.slots[index];
        for img in &mut slot.images {
            if !img.request_encode {
                continue;
            }
            tracing::info!(slot = index, image = img.id, "encoding image");
            img.n_tokens = encoder.n_patches();
            img.embedding = encoder.encode(&img.pixels, img.width, img.height)?;
            img.request_encode = false;
        }
        Ok(true)
    }

    /// Decode the pending text segment, splice each image's embedding into
    /// the slot's sequence, and queue the text that follows it.
    fn ingest_images(&mut self, index: usize) -> Result<(), CoreError> {
        let n_embd = self.engine.n_embd();
        let n_batch = self.config.n_batch;

        let mut image_idx = 0;
        while image_idx < self.slots[index].images.len() {
            // text segment accumulated so far
            self.decode_batch_plain()?;

            let embedding_batch = {
                let slot = &self.slots[index];
                let img = &slot.images[image_idx];
                LlamaBatch::embedding(
                    img.embedding.clone(),
                    n_embd,
                    slot.n_past as LlamaPos,
                    slot.id as LlamaSeqId,
                )
            };
            let rows = embedding_batch.n_tokens();
            let mut i = 0;
            while i < rows {
                let n_tokens = n_batch.min(rows - i);
                let view = embedding_batch.view(i, n_tokens);
                self.engine.decode(&view)?;
                i += n_tokens;
            }
            {
                let slot = &mut self.slots[index];
                slot.n_past += rows;
                // one cache entry per resident embedding row
                slot.cache_tokens
                    .extend(std::iter::repeat(IMAGE_EMBEDDING_CELL).take(rows));
            }

            image_idx += 1;
            self.batch.clear();

            let segment = if image_idx >= self.slots[index].images.len() {
                self.slots[index].params.input_suffix.clone()
            } else {
                self.slots[index].images[image_idx].prefix_prompt.clone()
            };
            let append_tokens = self.engine.tokenize(&segment, false, true)?;
            let slot = &mut self.slots[index];
            for token in append_tokens {
                self.batch
                    .add(token, slot.n_past as LlamaPos, &[slot.id as LlamaSeqId], true)?;
                slot.cache_tokens.push(token);
                slot.n_past += 1;
            }
        }
        Ok(())
    }

    // ── Decode & sample ──────────────────────────────────────────────────────

    fn decode_and_sample(&mut self) -> Result<(), CoreError> {
        let total = self.batch.n_tokens();
        let mut n_batch = self.config.n_batch;
        let mut i = 0;

        while i < total {
            let n_tokens = n_batch.min(total - i);

            let result = {
                let view = self.batch.view(i, n_tokens);
                self.engine.decode(&view)
            };
            match result {
                Ok(()) => {}
                Err(LlamaError::KvPressure(code)) if n_batch > 1 => {
                    // retry with half the batch to find a free KV span
                    n_batch /= 2;
                    tracing::warn!(code, n_batch, "KV cache pressure, halving batch");
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, n_batch, "failed to decode batch");
                    return Err(err.into());
                }
            }

            for index in 0..self.slots.len() {
                let Some(i_batch) = self.slots[index].i_batch else {
                    continue;
                };
                if i_batch < i || i_batch >= i + n_tokens {
                    continue;
                }

                if self.slots[index].embedding {
                    self.send_embedding(index);
                    self.slots[index].release();
                    self.slots[index].i_batch = None;
                    return Ok(());
                }

                let nl = self.engine.token_nl();
                let output = {
                    let slot = &mut self.slots[index];
                    let Some(sampler) = slot.sampler.as_mut() else {
                        continue;
                    };
                    let logits = self.engine.logits(i_batch - i);
                    if logits.is_empty() {
                        continue;
                    }
                    let token = sampler.sample(logits, nl);
                    sampler.accept(token, true);
                    let n_probs = sampler.params().n_probs;
                    let probs = sampler
                        .candidates()
                        .iter()
                        .take(n_probs)
                        .map(|data| (data.id, data.p))
                        .collect();
                    CompletionOutput { tok: token, probs }
                };

                {
                    let slot = &mut self.slots[index];
                    if slot.n_decoded == 1 {
                        let now = Instant::now();
                        slot.t_start_generation = Some(now);
                        if let Some(start) = slot.t_start_process_prompt {
                            slot.t_prompt_processing = now - start;
                        }
                    }
                }

                let more = self.process_token(index, output)?;
                if !more {
                    self.slots[index].release();
                    self.log_slot_timings(index);
                    self.send_final_response(index);
                }
                self.slots[index].i_batch = None;
            }

            i += n_tokens;
        }
        Ok(())
    }

    /// Append a sampled token to the slot's output, run stop detection and
    /// UTF-8 framing, and stream the flushed bytes.  Returns whether the
    /// slot keeps generating.
    fn process_token(&mut self, index: usize, output: CompletionOutput) -> Result<bool, CoreError> {
        let piece = self.engine.token_to_piece(output.tok)?;
        let eos = self.engine.token_eos();

        let mut flushed: Option<Vec<u8>> = None;
        {
            let slot = &mut self.slots[index];
            slot.sampled = output.tok;
            slot.generated.extend_from_slice(&piece);
            slot.has_next_token = true;

            slot.update_multibyte(&piece);

            if slot.multibyte_pending == 0 {
                let mut pos = slot.sent_count.min(slot.generated.len());

                let tail = slot.generated[pos..].to_vec();
                let full_pos = slot.find_stop_full(&tail, piece.len());
                let mut is_stop_full = false;
                let stop_pos = match full_pos {
                    Some(sp) => {
                        is_stop_full = true;
                        slot.generated.truncate(pos + sp);
                        pos = slot.sent_count.min(slot.generated.len());
                        Some(sp)
                    }
                    None => slot.find_stop_partial(&tail),
                };

                // flush when nothing might still grow into a stop word, or
                // when a full match settled the text before the stop word
                let flush = match stop_pos {
                    None => true,
                    Some(sp) => is_stop_full && sp > 0 && !slot.has_next_token,
                };
                if flush {
                    let text = slot.generated[pos..].to_vec();
                    slot.sent_count += text.len();
                    flushed = Some(text);
                }

                slot.add_token(output.clone());
            }

            if slot.multibyte_pending > 0 && !slot.has_next_token {
                slot.has_next_token = true;
            }
        }

        let stream = self.slots[index].params.stream;
        let emit_partial = self.slots[index].multibyte_pending == 0 && stream;
        if emit_partial {
            self.send_partial_response(index, flushed.unwrap_or_default())?;
        }

        let global_n_predict = self.config.n_predict;
        let slot = &mut self.slots[index];

        if slot.n_decoded > 2 && slot.has_next_token && !slot.has_budget(global_n_predict) {
            slot.stopped_limit = true;
            slot.has_next_token = false;
        }

        if !slot.cache_tokens.is_empty() && output.tok == eos {
            slot.stopped_eos = true;
            slot.has_next_token = false;
        }

        tracing::trace!(
            slot = index,
            token = output.tok,
            has_next_token = slot.has_next_token,
            n_remaining = slot.n_remaining,
            n_decoded = slot.n_decoded,
            "next token"
        );

        Ok(slot.has_next_token)
    }

    // ── Results ──────────────────────────────────────────────────────────────

    fn send_error(&self, task_id: TaskId, message: &str) {
        self.hub.push_result(TaskResult {
            id: task_id,
            stop: true,
            error: true,
            payload: ResultPayload::Error(message.to_string()),
        });
    }

    fn send_partial_response(&mut self, index: usize, text: Vec<u8>) -> Result<(), CoreError> {
        let content = String::from_utf8_lossy(&text).into_owned();

        let completion_probabilities = if self.slots[index].sampling_params.n_probs > 0 {
            let sent_tokens = self.engine.tokenize(&content, false, false)?.len();
            let slot = &self.slots[index];
            let from = slot
                .sent_token_probs_index
                .min(slot.generated_token_probs.len());
            let to = (slot.sent_token_probs_index + sent_tokens).min(slot.generated_token_probs.len());
            let probs = self.format_probs(&self.slots[index].generated_token_probs[from..to]);
            self.slots[index].sent_token_probs_index = to;
            probs
        } else {
            Vec::new()
        };

        let slot = &self.slots[index];
        let Some(task_id) = slot.task_id else {
            return Ok(());
        };
        self.hub.push_result(TaskResult {
            id: task_id,
            stop: false,
            error: false,
            payload: ResultPayload::Partial(PartialPayload {
                content,
                slot_id: slot.id,
                multimodal: self.multimodal,
                completion_probabilities,
            }),
        });
        Ok(())
    }

    fn send_final_response(&mut self, index: usize) {
        let completion_probabilities = if self.slots[index].sampling_params.n_probs > 0 {
            let slot = &self.slots[index];
            let probs = if !slot.params.stream && slot.stopped_word {
                let stop_tokens = self
                    .engine
                    .tokenize(&slot.stopping_word, false, false)
                    .map(|tokens| tokens.len())
                    .unwrap_or(0);
                let keep = slot.generated_token_probs.len().saturating_sub(stop_tokens);
                &slot.generated_token_probs[..keep]
            } else {
                let to = slot
                    .sent_token_probs_index
                    .min(slot.generated_token_probs.len());
                &slot.generated_token_probs[..to]
            };
            self.format_probs(probs)
        } else {
            Vec::new()
        };

        let generation_settings = self.generation_settings(index);
        let slot = &self.slots[index];
        let Some(task_id) = slot.task_id else {
            return;
        };

        let content = if slot.params.stream {
            String::new()
        } else {
            String::from_utf8_lossy(&slot.generated).into_owned()
        };

        self.hub.push_result(TaskResult {
            id: task_id,
            stop: true,
            error: false,
            payload: ResultPayload::Final(Box::new(FinalPayload {
                content,
                slot_id: slot.id,
                model: self.config.model_alias.clone(),
                tokens_predicted: slot.n_decoded,
                tokens_evaluated: slot.num_prompt_tokens,
                truncated: slot.truncated,
                stopped_eos: slot.stopped_eos,
                stopped_word: slot.stopped_word,
                stopped_limit: slot.stopped_limit,
                stopping_word: slot.stopping_word.clone(),
                tokens_cached: slot.n_past,
                timings: slot.timings(),
                generation_settings,
                prompt: slot.prompt.clone(),
                completion_probabilities,
            })),
        });
    }

    fn send_embedding(&mut self, index: usize) {
        let n_embd = self.engine.n_embd();
        let embedding = if !self.config.embeddings {
            tracing::warn!(slot = index, "embedding disabled, returning zeros");
            vec![0.0; n_embd]
        } else {
            self.engine.embeddings().unwrap_or_else(|| vec![0.0; n_embd])
        };

        let slot = &self.slots[index];
        let Some(task_id) = slot.task_id else {
            return;
        };
        self.hub.push_result(TaskResult {
            id: task_id,
            stop: true,
            error: false,
            payload: ResultPayload::Embedding(embedding),
        });
    }

    fn format_probs(&self, outputs: &[CompletionOutput]) -> Vec<TokenProbs> {
        outputs
            .iter()
            .map(|output| TokenProbs {
                content: self.token_text(output.tok),
                probs: output
                    .probs
                    .iter()
                    .map(|&(tok, prob)| TokenProb {
                        tok_str: self.token_text(tok),
                        prob,
                    })
                    .collect(),
            })
            .collect()
    }

    /// Printable form of a token piece; lone continuation bytes are hex
    /// escaped.
    fn token_text(&self, token: i32) -> String {
        let piece = self.engine.token_to_piece(token).unwrap_or_default();
        if piece.len() == 1 && piece[0] & 0x80 == 0x80 {
            format!("byte: \\x{:02x}", piece[0])
        } else {
            String::from_utf8_lossy(&piece).into_owned()
        }
    }

    fn generation_settings(&self, index: usize) -> serde_json::Value {
        let slot = &self.slots[index];
        let sp = &slot.sampling_params;
        let eos = self.engine.token_eos();
        let ignore_eos = sp
            .logit_bias
            .get(&eos)
            .is_some_and(|bias| bias.is_infinite() && *bias < 0.0);
        json!({
            "n_ctx": slot.n_ctx,
            "model": self.config.model_alias,
            "seed": sp.seed,
            "temp": sp.temp,
            "top_k": sp.top_k,
            "top_p": sp.top_p,
            "tfs_z": sp.tfs_z,
            "typical_p": sp.typical_p,
            "repeat_last_n": sp.penalty_last_n,
            "repeat_penalty": sp.penalty_repeat,
            "presence_penalty": sp.penalty_present,
            "frequency_penalty": sp.penalty_freq,
            "mirostat": sp.mirostat,
            "mirostat_tau": sp.mirostat_tau,
            "mirostat_eta": sp.mirostat_eta,
            "penalize_nl": sp.penalize_nl,
            "stop": slot.params.antiprompt,
            "n_predict": slot.params.n_predict,
            "n_keep": slot.params.n_keep,
            "ignore_eos": ignore_eos,
            "stream": slot.params.stream,
            "n_probs": sp.n_probs,
            "grammar": sp.grammar,
        })
    }

    fn log_slot_timings(&self, index: usize) {
        let slot = &self.slots[index];
        let timings = slot.timings();
        tracing::info!(
            slot = slot.id,
            prompt_n = timings.prompt_n,
            prompt_ms = timings.prompt_ms,
            predicted_n = timings.predicted_n,
            predicted_ms = timings.predicted_ms,
            "slot finished"
        );
    }

    #[cfg(test)]
    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    #[cfg(test)]
    pub(crate) fn system_tokens_len(&self) -> usize {
        self.system.tokens.len()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::ImageData;
    use crate::params::SlotParams;
    use base64::Engine as _;
    use kiln_llama::mock::{MockEngine, MockImageEncoder, MOCK_BOS};

    fn make_scheduler(engine: MockEngine, config: RuntimeConfig) -> (Scheduler, Arc<TaskHub>) {
        let hub = Arc::new(TaskHub::new());
        let scheduler = Scheduler::new(Box::new(engine), config, Arc::clone(&hub));
        (scheduler, hub)
    }

    fn request(prompt: &str, n_predict: i32) -> CompletionRequest {
        CompletionRequest {
            prompt: PromptInput::Text(prompt.into()),
            params: SlotParams {
                n_predict,
                ..SlotParams::default()
            },
            ..CompletionRequest::default()
        }
    }

    /// Tick until a final (or error) result for `task_id` shows up.
    fn run_task(
        scheduler: &mut Scheduler,
        hub: &TaskHub,
        task_id: TaskId,
        max_ticks: usize,
    ) -> Vec<TaskResult> {
        let mut collected = Vec::new();
        for _ in 0..max_ticks {
            scheduler.update_slots().expect("tick failed");
            collected.extend(hub.take_results());
            if collected.iter().any(|res| res.id == task_id && res.stop) {
                return collected;
            }
        }
        panic!("task {task_id} did not finish within {max_ticks} ticks");
    }

    fn final_payload(results: &[TaskResult], task_id: TaskId) -> &FinalPayload {
        results
            .iter()
            .find_map(|res| match &res.payload {
                ResultPayload::Final(fin) if res.id == task_id => Some(fin.as_ref()),
                _ => None,
            })
            .expect("no final payload")
    }

    fn png_b64(width: u32, height: u32) -> String {
        let mut buf = Vec::new();
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([1, 2, 3]));
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(buf)
    }

    #[test]
    fn scripted_completion_runs_to_eos() {
        let engine = MockEngine::new(256).with_script("abc");
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let id = hub.request_completion(request("zz", 16), false, false);
        let results = run_task(&mut scheduler, &hub, id, 64);

        let fin = final_payload(&results, id);
        assert_eq!(fin.content, "abc");
        assert!(fin.stopped_eos);
        assert!(!fin.stopped_limit);
        assert_eq!(fin.tokens_evaluated, 3); // BOS + "zz"
    }

    #[test]
    fn budget_limit_stops_generation() {
        let engine = MockEngine::new(256); // parrot
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let id = hub.request_completion(request("ab", 4), false, false);
        let results = run_task(&mut scheduler, &hub, id, 64);

        let fin = final_payload(&results, id);
        assert!(fin.stopped_limit);
        assert_eq!(fin.tokens_predicted, 4);
    }

    #[test]
    fn stop_word_truncates_output() {
        let engine = MockEngine::new(256).with_script("Xbc, 5qr");
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let mut req = request("z", 50);
        req.params.antiprompt = vec![", 5".into()];
        let id = hub.request_completion(req, false, false);
        let results = run_task(&mut scheduler, &hub, id, 64);

        let fin = final_payload(&results, id);
        assert!(fin.stopped_word);
        assert_eq!(fin.stopping_word, ", 5");
        assert_eq!(fin.content, "Xbc");
        assert!(!fin.content.contains(", 5"));
    }

    #[test]
    fn streaming_flushes_only_complete_codepoints() {
        // "é" is two bytes; the mock emits them as two separate tokens
        let engine = MockEngine::new(256).with_script("café!");
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let mut req = request("q", 16);
        req.params.stream = true;
        let id = hub.request_completion(req, false, false);
        let results = run_task(&mut scheduler, &hub, id, 64);

        let mut streamed = String::new();
        for res in &results {
            if let ResultPayload::Partial(partial) = &res.payload {
                // every flushed chunk is valid UTF-8 by construction of the
                // result type; make sure no chunk carries a lone byte of é
                assert!(!partial.content.contains('\u{fffd}'));
                streamed.push_str(&partial.content);
            }
        }
        assert_eq!(streamed, "café!");
    }

    #[test]
    fn prefix_reuse_skips_cached_prompt() {
        let engine = MockEngine::new(256);
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let mut first = request("hello world", 2);
        first.params.cache_prompt = true;
        first.slot_id = 0;
        let id = hub.request_completion(first, false, false);
        let results = run_task(&mut scheduler, &hub, id, 64);
        assert!(final_payload(&results, id).timings.prompt_n > 0);

        let mut second = request("hello world", 2);
        second.params.cache_prompt = true;
        second.slot_id = 0;
        let id = hub.request_completion(second, false, false);
        let results = run_task(&mut scheduler, &hub, id, 64);
        // the whole prompt was reused from cache
        assert_eq!(final_payload(&results, id).timings.prompt_n, 0);
    }

    #[test]
    fn context_shift_keeps_pinned_head() {
        let engine = MockEngine::new(32);
        let config = RuntimeConfig {
            n_batch: 32,
            ..RuntimeConfig::default()
        };
        let (mut scheduler, hub) = make_scheduler(engine, config);

        let mut req = request("abcdefgh", 40);
        req.params.cache_prompt = true;
        req.params.n_keep = 4;
        let id = hub.request_completion(req, false, false);
        let results = run_task(&mut scheduler, &hub, id, 256);

        let fin = final_payload(&results, id);
        assert!(fin.truncated);
        assert!(fin.stopped_limit);

        let head: Vec<i32> = vec![MOCK_BOS, b'a' as i32, b'b' as i32, b'c' as i32];
        assert_eq!(&scheduler.slot(0).cache_tokens[..4], &head[..]);
        assert!(scheduler.slot(0).cache_tokens.len() < 32);
    }

    #[test]
    fn cancel_releases_slot_within_a_tick() {
        let engine = MockEngine::new(256);
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let mut req = request("spin", 1000);
        req.params.stream = true;
        let id = hub.request_completion(req, false, false);
        for _ in 0..4 {
            scheduler.update_slots().unwrap();
        }
        assert!(scheduler.slot(0).is_processing());

        hub.request_cancel(id);
        scheduler.update_slots().unwrap();
        scheduler.update_slots().unwrap();
        assert!(scheduler.slot(0).available());

        // no further chunks after the cancel settled
        hub.take_results();
        scheduler.update_slots().unwrap();
        assert!(hub.take_results().is_empty());
    }

    #[test]
    fn no_free_slot_fails_the_task() {
        let engine = MockEngine::new(256);
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let busy = hub.request_completion(request("spin", 1000), false, false);
        scheduler.update_slots().unwrap();

        let rejected = hub.request_completion(request("more", 10), false, false);
        scheduler.update_slots().unwrap();

        let results = hub.take_results();
        let res = results.iter().find(|res| res.id == rejected).unwrap();
        assert!(res.error);
        assert_eq!(res.content(), "slot unavailable");
        assert!(results.iter().all(|res| res.id != busy || !res.error));
    }

    #[test]
    fn embedding_task_returns_vector() {
        let engine = MockEngine::new(256).with_embeddings();
        let config = RuntimeConfig {
            embeddings: true,
            ..RuntimeConfig::default()
        };
        let (mut scheduler, hub) = make_scheduler(engine, config);

        let id = hub.request_completion(request("abc", 1), false, true);
        let results = run_task(&mut scheduler, &hub, id, 64);
        let res = results.iter().find(|res| res.id == id && res.stop).unwrap();
        match &res.payload {
            ResultPayload::Embedding(embedding) => assert_eq!(embedding.len(), 8),
            other => panic!("expected embedding payload, got {other:?}"),
        }
    }

    #[test]
    fn embedding_disabled_returns_zeros() {
        let engine = MockEngine::new(256).with_embeddings();
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let id = hub.request_completion(request("abc", 1), false, true);
        let results = run_task(&mut scheduler, &hub, id, 64);
        let res = results.iter().find(|res| res.id == id && res.stop).unwrap();
        match &res.payload {
            ResultPayload::Embedding(embedding) => {
                assert!(embedding.iter().all(|&x| x == 0.0));
            }
            other => panic!("expected embedding payload, got {other:?}"),
        }
    }

    #[test]
    fn kv_pressure_halves_batch_and_recovers() {
        let mut engine = MockEngine::new(256);
        engine.fail_next_decode(1);
        let config = RuntimeConfig {
            n_batch: 4,
            ..RuntimeConfig::default()
        };
        let (mut scheduler, hub) = make_scheduler(engine, config);

        let id = hub.request_completion(request("abcd", 1), false, false);
        let results = run_task(&mut scheduler, &hub, id, 64);
        assert!(!final_payload(&results, id).content.is_empty());
    }

    #[test]
    fn fatal_decode_stops_the_tick() {
        let mut engine = MockEngine::new(256);
        engine.fail_next_decode(16);
        let config = RuntimeConfig {
            n_batch: 1,
            ..RuntimeConfig::default()
        };
        let (mut scheduler, hub) = make_scheduler(engine, config);

        hub.request_completion(request("abcd", 1), false, false);
        let mut failed = false;
        for _ in 0..8 {
            if scheduler.update_slots().is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn empty_prompt_answers_immediately() {
        let engine = MockEngine::new(256);
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let id = hub.request_completion(request("", 8), false, false);
        let results = run_task(&mut scheduler, &hub, id, 8);
        assert_eq!(final_payload(&results, id).content, "");
        scheduler.update_slots().unwrap();
        assert!(scheduler.slot(0).available());
    }

    #[test]
    fn infill_task_generates() {
        let engine = MockEngine::new(256).with_script("body");
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let mut req = request("", 16);
        req.params.input_prefix = "fn f() {".into();
        req.params.input_suffix = "}".into();
        let id = hub.request_completion(req, true, false);
        let results = run_task(&mut scheduler, &hub, id, 64);

        let fin = final_payload(&results, id);
        assert_eq!(fin.content, "body");
        assert!(fin.stopped_eos);
    }

    #[test]
    fn system_prompt_updates_once_idle() {
        let engine = MockEngine::new(256).with_script("r");
        let config = RuntimeConfig {
            n_parallel: 2,
            ..RuntimeConfig::default()
        };
        let (mut scheduler, hub) = make_scheduler(engine, config);

        let mut req = request("q", 4);
        req.system_prompt = Some(SystemPromptUpdate {
            prompt: "sys".into(),
            ..SystemPromptUpdate::default()
        });
        let id = hub.request_completion(req, false, false);
        run_task(&mut scheduler, &hub, id, 64);

        // once every slot went idle, the shared prefix was tokenized in
        for _ in 0..4 {
            scheduler.update_slots().unwrap();
        }
        assert_eq!(scheduler.system_tokens_len(), 4); // BOS + "sys"

        let id = hub.request_completion(request("q", 4), false, false);
        let results = run_task(&mut scheduler, &hub, id, 64);
        assert!(!final_payload(&results, id).content.is_empty());
    }

    #[test]
    fn multimodal_prompt_splices_image() {
        let encoder = MockImageEncoder::default();
        let engine = MockEngine::new(256)
            .with_script("ok")
            .with_image_encoder(encoder);
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let mut req = request("look [img-0] describe", 16);
        req.images = vec![ImageData { id: 0, data: png_b64(2, 2) }];
        let id = hub.request_completion(req, false, false);
        let results = run_task(&mut scheduler, &hub, id, 64);

        let fin = final_payload(&results, id);
        assert_eq!(fin.content, "ok");
        // prefix "look " with BOS (6) + 4 image patches + " describe" (9),
        // plus the generated tokens
        let slot = scheduler.slot(0);
        assert!(slot.n_past >= 19);
        // embedding rows and spliced text segments all have cache entries
        assert_eq!(slot.cache_tokens.len(), slot.n_past);
    }

    #[test]
    fn multimodal_cache_tracks_every_position() {
        let engine = MockEngine::new(256)
            .with_script("ok")
            .with_image_encoder(MockImageEncoder::default());
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let mut req = request("look [img-0] describe", 16);
        req.images = vec![ImageData { id: 0, data: png_b64(2, 2) }];
        let id = hub.request_completion(req, false, false);

        for _ in 0..64 {
            scheduler.update_slots().unwrap();
            let slot = scheduler.slot(0);
            if slot.state == SlotState::Processing {
                assert_eq!(slot.cache_tokens.len(), slot.n_past);
                assert!(slot.n_past <= slot.n_ctx);
            }
            if hub.take_results().iter().any(|res| res.id == id && res.stop) {
                break;
            }
        }
    }

    #[test]
    fn bad_image_id_fails_the_task() {
        let engine = MockEngine::new(256).with_image_encoder(MockImageEncoder::default());
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let mut req = request("see [img-7]", 4);
        req.images = vec![ImageData { id: 0, data: png_b64(1, 1) }];
        let id = hub.request_completion(req, false, false);
        scheduler.update_slots().unwrap();

        let results = hub.take_results();
        let res = results.iter().find(|res| res.id == id).unwrap();
        assert!(res.error);
        scheduler.update_slots().unwrap();
        assert!(scheduler.slot(0).available());
    }

    #[test]
    fn cache_consistency_invariant_holds_each_tick() {
        let engine = MockEngine::new(128);
        let (mut scheduler, hub) = make_scheduler(engine, RuntimeConfig::default());

        let id = hub.request_completion(request("invariants", 12), false, false);
        for _ in 0..64 {
            scheduler.update_slots().unwrap();
            let slot = scheduler.slot(0);
            if slot.state == SlotState::Processing {
                assert_eq!(slot.cache_tokens.len(), slot.n_past);
                assert!(slot.n_past <= slot.n_ctx);
            }
            if hub.take_results().iter().any(|res| res.id == id && res.stop) {
                break;
            }
        }
    }
}
