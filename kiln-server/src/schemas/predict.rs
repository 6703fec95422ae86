//! Predict request/response types and their mapping onto scheduler tasks.

use kiln_core::{CompletionRequest, ImageData, PromptInput, SlotParams};
use kiln_llama::SamplingParams;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct PredictOptions {
    pub prompt: String,
    /// New tokens to predict; 0 means unlimited.
    pub tokens: i32,
    #[serde(alias = "topk")]
    pub top_k: i32,
    #[serde(alias = "topp")]
    pub top_p: f32,
    #[serde(alias = "tailfreesamplingz")]
    pub tail_free_sampling_z: f32,
    #[serde(alias = "typicalp")]
    pub typical_p: f32,
    pub temperature: f32,
    /// Window of last tokens penalized for repetition.
    pub repeat: i32,
    /// Repetition penalty factor.
    pub penalty: f32,
    #[serde(alias = "frequencypenalty")]
    pub frequency_penalty: f32,
    #[serde(alias = "presencepenalty")]
    pub presence_penalty: f32,
    pub mirostat: i32,
    #[serde(alias = "mirostattau")]
    pub mirostat_tau: f32,
    #[serde(alias = "mirostateta")]
    pub mirostat_eta: f32,
    #[serde(alias = "penalizenl")]
    pub penalize_nl: bool,
    #[serde(alias = "nkeep")]
    pub n_keep: i32,
    pub seed: i32,
    pub grammar: String,
    #[serde(alias = "ignoreeos")]
    pub ignore_eos: bool,
    #[serde(alias = "stopprompts")]
    pub stop_prompts: Vec<String>,
    /// Base64-encoded images; ids are assigned by position.
    pub images: Vec<String>,
    #[serde(alias = "promptcacheall")]
    pub prompt_cache_all: bool,
}

impl PredictOptions {
    /// Build the scheduler task for this request.
    pub fn to_request(&self, streaming: bool) -> CompletionRequest {
        let params = SlotParams {
            stream: streaming,
            cache_prompt: self.prompt_cache_all,
            n_keep: self.n_keep,
            n_predict: if self.tokens == 0 { -1 } else { self.tokens },
            antiprompt: self
                .stop_prompts
                .iter()
                .filter(|word| !word.is_empty())
                .cloned()
                .collect(),
            ..SlotParams::default()
        };

        let sampling = SamplingParams {
            top_k: self.top_k,
            top_p: self.top_p,
            tfs_z: self.tail_free_sampling_z,
            typical_p: self.typical_p,
            temp: self.temperature,
            penalty_last_n: self.repeat,
            penalty_repeat: self.penalty,
            penalty_freq: self.frequency_penalty,
            penalty_present: self.presence_penalty,
            mirostat: self.mirostat,
            mirostat_tau: self.mirostat_tau,
            mirostat_eta: self.mirostat_eta,
            penalize_nl: self.penalize_nl,
            seed: self.seed as u32,
            grammar: self.grammar.clone(),
            ..SamplingParams::default()
        };

        CompletionRequest {
            prompt: PromptInput::Text(self.prompt.clone()),
            params,
            sampling,
            ignore_eos: self.ignore_eos,
            images: self
                .images
                .iter()
                .enumerate()
                .map(|(i, data)| ImageData {
                    id: i as i32,
                    data: data.clone(),
                })
                .collect(),
            ..CompletionRequest::default()
        }
    }
}

/// One message of a Predict or PredictStream response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Reply {
    pub message: String,
}

/// Response of the embedding endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EmbeddingResult {
    pub embedding: Vec<f32>,
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_tokens_means_unlimited() {
        let opts = PredictOptions::default();
        assert_eq!(opts.to_request(false).params.n_predict, -1);

        let opts = PredictOptions {
            tokens: 7,
            ..PredictOptions::default()
        };
        assert_eq!(opts.to_request(false).params.n_predict, 7);
    }

    #[test]
    fn empty_stop_prompts_are_dropped() {
        let opts = PredictOptions {
            stop_prompts: vec!["".into(), "STOP".into()],
            ..PredictOptions::default()
        };
        let request = opts.to_request(false);
        assert_eq!(request.params.antiprompt, vec!["STOP".to_string()]);
    }

    #[test]
    fn images_get_positional_ids() {
        let opts = PredictOptions {
            images: vec!["aGk=".into(), "eW8=".into()],
            ..PredictOptions::default()
        };
        let request = opts.to_request(false);
        assert_eq!(request.images.len(), 2);
        assert_eq!(request.images[0].id, 0);
        assert_eq!(request.images[1].id, 1);
    }

    #[test]
    fn wire_aliases_deserialize() {
        let opts: PredictOptions = serde_json::from_str(
            r#"{"prompt": "hi", "topk": 30, "stopprompts": ["x"], "promptcacheall": true, "ignoreeos": true}"#,
        )
        .unwrap();
        assert_eq!(opts.top_k, 30);
        assert_eq!(opts.stop_prompts, vec!["x".to_string()]);
        assert!(opts.prompt_cache_all);
        assert!(opts.ignore_eos);
    }

    #[test]
    fn streaming_flag_reaches_slot_params() {
        let opts = PredictOptions::default();
        assert!(opts.to_request(true).params.stream);
        assert!(!opts.to_request(false).params.stream);
    }
}
