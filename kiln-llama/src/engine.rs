use crate::batch::BatchView;
use crate::error::LlamaError;
use crate::token::{LlamaPos, LlamaSeqId, LlamaToken};

/// The decoder surface the scheduler drives.
///
/// Implementations wrap one loaded model plus one inference context.  The
/// scheduler is the only caller and runs on a single thread, so the trait
/// only requires `Send`.
///
/// Logits for entry `i` of the last decoded chunk are read back with
/// [`LlamaEngine::logits`]; `i` indexes into that chunk, and is only valid
/// for entries that requested logits.
pub trait LlamaEngine: Send {
    // ── Vocabulary ───────────────────────────────────────────────────────────

    /// Tokenize UTF-8 text.  `add_bos` prepends the BOS token,
    /// `parse_special` allows special-token text forms in the input.
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<LlamaToken>, LlamaError>;

    /// The byte piece of one token.  May be a partial UTF-8 sequence.
    fn token_to_piece(&self, token: LlamaToken) -> Result<Vec<u8>, LlamaError>;

    fn token_bos(&self) -> LlamaToken;
    fn token_eos(&self) -> LlamaToken;
    fn token_nl(&self) -> LlamaToken;

    /// Infill delimiters.
    fn token_prefix(&self) -> LlamaToken;
    fn token_middle(&self) -> LlamaToken;
    fn token_suffix(&self) -> LlamaToken;

    fn n_vocab(&self) -> usize;
    fn n_ctx(&self) -> u32;
    fn n_embd(&self) -> usize;

    // ── Decoding ─────────────────────────────────────────────────────────────

    /// Decode one chunk.
    ///
    /// # Errors
    /// [`LlamaError::KvPressure`] when the KV cache has no free span for the
    /// chunk (retry with a smaller one); [`LlamaError::DecodeFailed`] is
    /// fatal.
    fn decode(&mut self, batch: &BatchView<'_>) -> Result<(), LlamaError>;

    /// Logits row of entry `i` in the last decoded chunk.
    fn logits(&self, i: usize) -> &[f32];

    /// Pooled embeddings of the last decoded sequence, when the context was
    /// created with embeddings enabled.
    fn embeddings(&self) -> Option<Vec<f32>>;

    // ── KV cache ─────────────────────────────────────────────────────────────

    /// Remove positions `[p0, p1)` of `seq` from the cache; `p1 < 0` means
    /// "to the end".
    fn kv_seq_rm(&mut self, seq: LlamaSeqId, p0: LlamaPos, p1: LlamaPos);

    /// Copy positions `[p0, p1)` from `src` into `dst` (cells are shared on
    /// real engines; the contract is only that `dst` observes the tokens).
    fn kv_seq_cp(&mut self, src: LlamaSeqId, dst: LlamaSeqId, p0: LlamaPos, p1: LlamaPos);

    /// Shift positions `[p0, p1)` of `seq` by `delta` (negative = left).
    fn kv_seq_shift(&mut self, seq: LlamaSeqId, p0: LlamaPos, p1: LlamaPos, delta: LlamaPos);

    /// Drop every sequence from the cache.
    fn kv_clear(&mut self);

    // ── Multimodal ───────────────────────────────────────────────────────────

    /// The image encoder bundled with this engine, when the model was loaded
    /// with a multimodal projector.
    fn image_encoder(&self) -> Option<&dyn ImageEncoder> {
        None
    }
}

/// Image-to-embedding encoder (the CLIP side of a multimodal model).
///
/// Preprocessing (pad to square, resize, normalize) happens behind
/// [`ImageEncoder::encode`]; the caller only supplies raw RGB8 pixels.
pub trait ImageEncoder: Send {
    /// Number of embedding rows one image produces.
    fn n_patches(&self) -> usize;

    /// Embedding width; must match the language model's `n_embd`.
    fn n_embd(&self) -> usize;

    /// Encode one RGB8 image into `n_patches() * n_embd()` floats.
    fn encode(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<f32>, LlamaError>;
}
