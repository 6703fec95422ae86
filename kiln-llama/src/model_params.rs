/// The maximum number of devices a tensor split may address.
pub const MAX_DEVICES: usize = 16;

/// Parameters for loading a model.
#[derive(Debug, Clone)]
pub struct LlamaModelParams {
    /// Number of GPU layers to offload (-1 = all).
    pub n_gpu_layers: i32,
    /// Device holding the whole model when not splitting (index into the
    /// visible device list).
    pub main_gpu: i32,
    /// Per-device fraction of the model; unused trailing entries are zero.
    pub tensor_split: [f32; MAX_DEVICES],
    /// Use memory-mapped I/O if available.
    pub use_mmap: bool,
    /// Lock model weights in RAM (prevent swapping).
    pub use_mlock: bool,
    /// LoRA adapters to apply, as `(path, scale)` pairs.
    pub lora_adapters: Vec<(std::path::PathBuf, f32)>,
    /// Base model for LoRA application, when the adapter needs one.
    pub lora_base: Option<std::path::PathBuf>,
}

impl Default for LlamaModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            main_gpu: 0,
            tensor_split: [0.0; MAX_DEVICES],
            use_mmap: true,
            use_mlock: false,
            lora_adapters: Vec::new(),
            lora_base: None,
        }
    }
}

impl LlamaModelParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_gpu_layers(mut self, n: i32) -> Self {
        self.n_gpu_layers = n;
        self
    }

    pub fn main_gpu(mut self, device: i32) -> Self {
        self.main_gpu = device;
        self
    }

    pub fn use_mmap(mut self, v: bool) -> Self {
        self.use_mmap = v;
        self
    }

    pub fn use_mlock(mut self, v: bool) -> Self {
        self.use_mlock = v;
        self
    }
}
