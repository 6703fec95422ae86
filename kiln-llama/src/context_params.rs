/// RoPE frequency scaling applied by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RopeScaling {
    None,
    #[default]
    Linear,
    Yarn,
}

/// Parameters for creating an inference context.
#[derive(Debug, Clone)]
pub struct LlamaContextParams {
    /// Context window size shared by all sequences.
    pub n_ctx: u32,
    /// Maximum batch size for decoding.
    pub n_batch: u32,
    /// Number of threads for generation and batch processing.
    pub n_threads: i32,
    /// Keep the KV cache in half precision.
    pub f16_kv: bool,
    /// Compute pooled embeddings for decoded sequences.
    pub embeddings: bool,
    /// RoPE scaling mode.
    pub rope_scaling: RopeScaling,
    /// RoPE base frequency (0 = engine default).
    pub rope_freq_base: f32,
    /// RoPE frequency scale (0 = engine default).
    pub rope_freq_scale: f32,
    /// YaRN extrapolation mix factor (0 = engine default).
    pub yarn_ext_factor: f32,
    /// YaRN attention magnitude factor (0 = engine default).
    pub yarn_attn_factor: f32,
    /// YaRN low-correction dimension (0 = engine default).
    pub yarn_beta_fast: f32,
    /// YaRN high-correction dimension (0 = engine default).
    pub yarn_beta_slow: f32,
}

impl Default for LlamaContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_batch: 512,
            n_threads: 4,
            f16_kv: true,
            embeddings: false,
            rope_scaling: RopeScaling::default(),
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            yarn_ext_factor: 0.0,
            yarn_attn_factor: 0.0,
            yarn_beta_fast: 0.0,
            yarn_beta_slow: 0.0,
        }
    }
}

impl LlamaContextParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_ctx(mut self, v: u32) -> Self {
        self.n_ctx = v;
        self
    }

    pub fn n_batch(mut self, v: u32) -> Self {
        self.n_batch = v;
        self
    }

    pub fn n_threads(mut self, v: i32) -> Self {
        self.n_threads = v;
        self
    }

    pub fn embeddings(mut self, v: bool) -> Self {
        self.embeddings = v;
        self
    }
}
