//! LoadModel request/response types.
//!
//! Field aliases accept the squashed wire names of the upstream protocol
//! (`modelfile`, `contextsize`, ...).

use std::path::PathBuf;

use kiln_llama::{LlamaContextParams, LlamaModelParams, RopeScaling, MAX_DEVICES};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::error::ServerError;

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct ModelOptions {
    /// Path to the model weights.
    #[serde(alias = "modelfile")]
    pub model_file: String,
    /// Multimodal projector file, resolved relative to the model directory.
    #[serde(alias = "mmproj")]
    pub mm_proj: String,
    #[serde(alias = "contextsize")]
    pub context_size: u32,
    #[serde(alias = "f16memory")]
    pub f16_memory: bool,
    pub threads: i32,
    #[serde(alias = "ngpulayers")]
    pub n_gpu_layers: i32,
    #[serde(alias = "nbatch")]
    pub n_batch: u32,
    /// Per-device split fractions, comma or slash separated.
    #[serde(alias = "tensorsplit")]
    pub tensor_split: String,
    /// Main device index, as a string (empty = default).
    #[serde(alias = "maingpu")]
    pub main_gpu: String,
    #[serde(alias = "loraadapter")]
    pub lora_adapter: String,
    #[serde(alias = "lorabase")]
    pub lora_base: String,
    #[serde(alias = "lorascale")]
    pub lora_scale: f32,
    pub mlock: bool,
    pub mmap: bool,
    pub embeddings: bool,
    /// One of `none`, `yarn`; anything else selects linear scaling.
    #[serde(alias = "ropescaling")]
    pub rope_scaling: String,
    #[serde(alias = "yarnextfactor")]
    pub yarn_ext_factor: f32,
    #[serde(alias = "yarnattnfactor")]
    pub yarn_attn_factor: f32,
    #[serde(alias = "yarnbetafast")]
    pub yarn_beta_fast: f32,
    #[serde(alias = "yarnbetaslow")]
    pub yarn_beta_slow: f32,
    #[serde(alias = "ropefreqbase")]
    pub rope_freq_base: f32,
    #[serde(alias = "ropefreqscale")]
    pub rope_freq_scale: f32,
}

impl ModelOptions {
    /// Directory the model file lives in; relative resource paths (mmproj,
    /// LoRA) resolve against it.
    pub fn model_dir(&self) -> PathBuf {
        PathBuf::from(&self.model_file)
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default()
    }

    pub fn mm_proj_path(&self) -> Option<PathBuf> {
        if self.mm_proj.is_empty() {
            None
        } else {
            Some(self.model_dir().join(&self.mm_proj))
        }
    }

    /// Translate the wire options into engine load/context parameters.
    pub fn to_engine_params(
        &self,
    ) -> Result<(LlamaModelParams, LlamaContextParams), ServerError> {
        let mut model = LlamaModelParams::new()
            .n_gpu_layers(self.n_gpu_layers)
            .use_mmap(self.mmap)
            .use_mlock(self.mlock);

        if !self.tensor_split.is_empty() {
            let parts: Vec<&str> = self
                .tensor_split
                .split(|c| c == ',' || c == '/')
                .filter(|part| !part.is_empty())
                .collect();
            if parts.len() > MAX_DEVICES {
                return Err(ServerError::BadRequest(format!(
                    "tensor split names {} devices, at most {} supported",
                    parts.len(),
                    MAX_DEVICES
                )));
            }
            for (i, part) in parts.iter().enumerate() {
                model.tensor_split[i] = part.parse().map_err(|_| {
                    ServerError::BadRequest(format!("invalid tensor split entry \"{part}\""))
                })?;
            }
        }

        if !self.main_gpu.is_empty() {
            model.main_gpu = self.main_gpu.parse().map_err(|_| {
                ServerError::BadRequest(format!("invalid main gpu \"{}\"", self.main_gpu))
            })?;
        }

        if !self.lora_adapter.is_empty() && !self.lora_base.is_empty() {
            let scale = if self.lora_scale != 0.0 {
                self.lora_scale
            } else {
                1.0
            };
            let dir = self.model_dir();
            model.lora_adapters.push((dir.join(&self.lora_adapter), scale));
            model.lora_base = Some(dir.join(&self.lora_base));
        }

        let mut ctx = LlamaContextParams::new().embeddings(self.embeddings);
        ctx.f16_kv = self.f16_memory;
        if self.context_size > 0 {
            ctx.n_ctx = self.context_size;
        }
        if self.n_batch > 0 {
            ctx.n_batch = self.n_batch;
        }
        if self.threads > 0 {
            ctx.n_threads = self.threads;
        }

        ctx.rope_scaling = match self.rope_scaling.as_str() {
            "none" => RopeScaling::None,
            "yarn" => RopeScaling::Yarn,
            _ => RopeScaling::Linear,
        };
        if self.yarn_ext_factor != 0.0 {
            ctx.yarn_ext_factor = self.yarn_ext_factor;
        }
        if self.yarn_attn_factor != 0.0 {
            ctx.yarn_attn_factor = self.yarn_attn_factor;
        }
        if self.yarn_beta_fast != 0.0 {
            ctx.yarn_beta_fast = self.yarn_beta_fast;
        }
        if self.yarn_beta_slow != 0.0 {
            ctx.yarn_beta_slow = self.yarn_beta_slow;
        }
        if self.rope_freq_base != 0.0 {
            ctx.rope_freq_base = self.rope_freq_base;
        }
        if self.rope_freq_scale != 0.0 {
            ctx.rope_freq_scale = self.rope_freq_scale;
        }

        Ok((model, ctx))
    }
}

/// Response of LoadModel.
#[derive(Debug, Clone, serde::Serialize, ToSchema)]
pub struct LoadResult {
    pub success: bool,
    pub message: String,
}

// ── Tests ──────────────────────────────────────────────────────────────────────
