//! Deterministic in-process engine used by the test suites and for smoke
//! runs without a real backend.
//!
//! Tokenization is byte-level (one token per byte, special ids above 255),
//! and the KV cache is tracked faithfully per sequence so cache-management
//! mistakes surface in tests.  Generation follows a script: after decoding
//! token `t`, the logits put all mass on the script entry following the last
//! occurrence of `t`, falling back to the script start for foreign tokens
//! and to EOS once the script is exhausted.  Without a script the engine
//! parrots the last token forever.

use std::collections::{BTreeMap, HashMap};

use crate::batch::{BatchPayload, BatchView};
use crate::engine::{ImageEncoder, LlamaEngine};
use crate::error::LlamaError;
use crate::token::{LlamaPos, LlamaSeqId, LlamaToken};

pub const MOCK_BOS: LlamaToken = 256;
pub const MOCK_EOS: LlamaToken = 257;
pub const MOCK_PREFIX: LlamaToken = 258;
pub const MOCK_SUFFIX: LlamaToken = 259;
pub const MOCK_MIDDLE: LlamaToken = 260;

const N_VOCAB: usize = 261;

/// Cache cell marker for rows fed from an embedding payload.
const EMBED_CELL: LlamaToken = -2;

pub struct MockEngine {
    n_ctx: u32,
    n_embd: usize,
    embeddings_enabled: bool,
    script: Vec<LlamaToken>,
    kv: HashMap<LlamaSeqId, BTreeMap<LlamaPos, LlamaToken>>,
    last_logits: HashMap<usize, Vec<f32>>,
    last_seq: LlamaSeqId,
    pressure_fuse: usize,
    image_encoder: Option<MockImageEncoder>,
}

impl MockEngine {
    pub fn new(n_ctx: u32) -> Self {
        Self {
            n_ctx,
            n_embd: 8,
            embeddings_enabled: false,
            script: Vec::new(),
            kv: HashMap::new(),
            last_logits: HashMap::new(),
            last_seq: 0,
            pressure_fuse: 0,
            image_encoder: None,
        }
    }

    /// Generate `text` after any prompt (see the module docs for the rule).
    pub fn with_script(mut self, text: &str) -> Self {
        self.script = text.bytes().map(|b| b as LlamaToken).collect();
        self
    }

    pub fn with_embeddings(mut self) -> Self {
        self.embeddings_enabled = true;
        self
    }

    pub fn with_image_encoder(mut self, encoder: MockImageEncoder) -> Self {
        self.n_embd = encoder.n_embd;
        self.image_encoder = Some(encoder);
        self
    }

    /// Make the next `times` decode calls report KV pressure.
    pub fn fail_next_decode(&mut self, times: usize) {
        self.pressure_fuse = times;
    }

    // ── Test introspection ───────────────────────────────────────────────────

    /// Tokens materialized in the cache for `seq`, in position order.
    pub fn seq_tokens(&self, seq: LlamaSeqId) -> Vec<(LlamaPos, LlamaToken)> {
        self.kv
            .get(&seq)
            .map(|cells| cells.iter().map(|(&p, &t)| (p, t)).collect())
            .unwrap_or_default()
    }

    /// Total occupied cache cells across all sequences.
    pub fn n_cells(&self) -> usize {
        self.kv.values().map(BTreeMap::len).sum()
    }

    fn next_token(&self, current: LlamaToken) -> LlamaToken {
        if self.script.is_empty() {
            return if (0..=255).contains(&current) { current } else { MOCK_EOS };
        }
        match self.script.iter().rposition(|&t| t == current) {
            Some(i) if i + 1 < self.script.len() => self.script[i + 1],
            Some(_) => MOCK_EOS,
            None => self.script[0],
        }
    }

    fn logits_row(&self, token: LlamaToken) -> Vec<f32> {
        let next = self.next_token(token);
        let mut row = vec![-100.0f32; N_VOCAB];
        if let Some(slot) = row.get_mut(next.max(0) as usize) {
            *slot = 100.0;
        }
        row
    }
}

impl LlamaEngine for MockEngine {
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        _parse_special: bool,
    ) -> Result<Vec<LlamaToken>, LlamaError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(MOCK_BOS);
        }
        tokens.extend(text.bytes().map(|b| b as LlamaToken));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: LlamaToken) -> Result<Vec<u8>, LlamaError> {
        match token {
            0..=255 => Ok(vec![token as u8]),
            MOCK_BOS | MOCK_EOS | MOCK_PREFIX | MOCK_SUFFIX | MOCK_MIDDLE => Ok(Vec::new()),
            _ => Err(LlamaError::UnknownToken(token)),
        }
    }

    fn token_bos(&self) -> LlamaToken {
        MOCK_BOS
    }

    fn token_eos(&self) -> LlamaToken {
        MOCK_EOS
    }

    fn token_nl(&self) -> LlamaToken {
        b'\n' as LlamaToken
    }

    fn token_prefix(&self) -> LlamaToken {
        MOCK_PREFIX
    }

    fn token_middle(&self) -> LlamaToken {
        MOCK_MIDDLE
    }

    fn token_suffix(&self) -> LlamaToken {
        MOCK_SUFFIX
    }

    fn n_vocab(&self) -> usize {
        N_VOCAB
    }

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn n_embd(&self) -> usize {
        self.n_embd
    }

    fn decode(&mut self, batch: &BatchView<'_>) -> Result<(), LlamaError> {
        if self.pressure_fuse > 0 {
            self.pressure_fuse -= 1;
            return Err(LlamaError::KvPressure(1));
        }
        if self.n_cells() + batch.n_tokens() > self.n_ctx as usize {
            return Err(LlamaError::KvPressure(1));
        }

        self.last_logits.clear();
        match batch.payload {
            BatchPayload::Tokens(tokens) => {
                for (i, &token) in tokens.iter().enumerate() {
                    for &seq in &batch.seq_ids[i] {
                        self.kv.entry(seq).or_default().insert(batch.pos[i], token);
                    }
                    if batch.logits[i] {
                        let row = self.logits_row(token);
                        self.last_logits.insert(i, row);
                        self.last_seq = batch.seq_ids[i][0];
                    }
                }
            }
            BatchPayload::Embeddings { .. } => {
                for i in 0..batch.n_tokens() {
                    for &seq in &batch.seq_ids[i] {
                        self.kv
                            .entry(seq)
                            .or_default()
                            .insert(batch.pos[i], EMBED_CELL);
                    }
                }
            }
        }
        Ok(())
    }

    fn logits(&self, i: usize) -> &[f32] {
        self.last_logits
            .get(&i)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn embeddings(&self) -> Option<Vec<f32>> {
        if !self.embeddings_enabled {
            return None;
        }
        let sum: i64 = self
            .kv
            .get(&self.last_seq)
            .map(|cells| cells.values().map(|&t| t as i64).sum())
            .unwrap_or(0);
        Some(
            (0..self.n_embd)
                .map(|i| ((sum + i as i64) % 97) as f32 / 97.0)
                .collect(),
        )
    }

    fn kv_seq_rm(&mut self, seq: LlamaSeqId, p0: LlamaPos, p1: LlamaPos) {
        if let Some(cells) = self.kv.get_mut(&seq) {
            cells.retain(|&p, _| p < p0 || (p1 >= 0 && p >= p1));
        }
    }

    fn kv_seq_cp(&mut self, src: LlamaSeqId, dst: LlamaSeqId, p0: LlamaPos, p1: LlamaPos) {
        let copied: Vec<(LlamaPos, LlamaToken)> = self
            .kv
            .get(&src)
            .map(|cells| {
                cells
                    .range(p0..p1.max(p0))
                    .map(|(&p, &t)| (p, t))
                    .collect()
            })
            .unwrap_or_default();
        let dst_cells = self.kv.entry(dst).or_default();
        for (p, t) in copied {
            dst_cells.insert(p, t);
        }
    }

    fn kv_seq_shift(&mut self, seq: LlamaSeqId, p0: LlamaPos, p1: LlamaPos, delta: LlamaPos) {
        let Some(cells) = self.kv.get_mut(&seq) else {
            return;
        };
        let moved: Vec<(LlamaPos, LlamaToken)> = cells
            .range(p0..p1.max(p0))
            .map(|(&p, &t)| (p, t))
            .collect();
        for (p, _) in &moved {
            cells.remove(p);
        }
        for (p, t) in moved {
            cells.insert(p + delta, t);
        }
    }

    fn kv_clear(&mut self) {
        self.kv.clear();
    }

    fn image_encoder(&self) -> Option<&dyn ImageEncoder> {
        self.image_encoder.as_ref().map(|e| e as &dyn ImageEncoder)
    }
}

/// Deterministic stand-in for a CLIP projector.
pub struct MockImageEncoder {
    pub n_patches: usize,
    pub n_embd: usize,
}

impl Default for MockImageEncoder {
    fn default() -> Self {
        Self {
            n_patches: 4,
            n_embd: 8,
        }
    }
}

impl ImageEncoder for MockImageEncoder {
    fn n_patches(&self) -> usize {
        self.n_patches
    }

    fn n_embd(&self) -> usize {
        self.n_embd
    }

    fn encode(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<f32>, LlamaError> {
        if pixels.len() != (width * height * 3) as usize {
            return Err(LlamaError::ImageEncodeFailed(format!(
                "pixel buffer is {} bytes, expected {}",
                pixels.len(),
                width * height * 3
            )));
        }
        let sum: u64 = pixels.iter().map(|&b| b as u64).sum();
        Ok((0..self.n_patches * self.n_embd)
            .map(|i| ((sum + i as u64) % 97) as f32 / 97.0)
            .collect())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::batch::LlamaBatch;

    fn decode_tokens(engine: &mut MockEngine, seq: LlamaSeqId, tokens: &[LlamaToken], pos0: LlamaPos) {
        let mut batch = LlamaBatch::new(tokens.len());
        for (i, &t) in tokens.iter().enumerate() {
            batch
                .add(t, pos0 + i as LlamaPos, &[seq], i == tokens.len() - 1)
                .unwrap();
        }
        let view = batch.view(0, batch.n_tokens());
        engine.decode(&view).unwrap();
    }

    #[test]
    fn script_continues_after_prompt() {
        let mut engine = MockEngine::new(64).with_script("abc");
        let tokens = engine.tokenize("hi", true, false).unwrap();
        decode_tokens(&mut engine, 0, &tokens, 0);
        let logits = engine.logits(tokens.len() - 1);
        let argmax = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i as LlamaToken)
            .unwrap();
        assert_eq!(argmax, b'a' as LlamaToken);
    }

    #[test]
    fn script_end_yields_eos() {
        let engine = MockEngine::new(64).with_script("ab");
        assert_eq!(engine.next_token(b'a' as LlamaToken), b'b' as LlamaToken);
        assert_eq!(engine.next_token(b'b' as LlamaToken), MOCK_EOS);
    }

    #[test]
    fn seq_rm_and_shift_move_cells() {
        let mut engine = MockEngine::new(64);
        decode_tokens(&mut engine, 1, &[10, 11, 12, 13, 14], 0);
        engine.kv_seq_rm(1, 1, 3);
        engine.kv_seq_shift(1, 3, 5, -2);
        assert_eq!(engine.seq_tokens(1), vec![(0, 10), (1, 13), (2, 14)]);
    }

    #[test]
    fn seq_cp_copies_range() {
        let mut engine = MockEngine::new(64);
        decode_tokens(&mut engine, 0, &[1, 2, 3], 0);
        engine.kv_seq_cp(0, 2, 0, 2);
        assert_eq!(engine.seq_tokens(2), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn capacity_pressure_reported() {
        let mut engine = MockEngine::new(4);
        let mut batch = LlamaBatch::new(8);
        for i in 0..6 {
            batch.add(i, i, &[0], false).unwrap();
        }
        let view = batch.view(0, 6);
        assert!(matches!(engine.decode(&view), Err(LlamaError::KvPressure(_))));
    }
}
