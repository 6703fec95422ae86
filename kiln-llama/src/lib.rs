//! Engine facade for the kiln inference server.
//!
//! The actual decoder (tokenizer, transformer, KV cache, image projector) is
//! an external collaborator; this crate pins down the surface the scheduler
//! drives: token and batch types, load/context parameters, the per-slot
//! sampling chain, and the [`LlamaEngine`] / [`ImageEncoder`] traits a
//! backend implements.  A deterministic [`mock`] engine backs the test
//! suites.
//!
//! # Usage
//!
//! ```rust
//! use kiln_llama::{LlamaBatch, LlamaEngine, SamplerChain, SamplingParams};
//! use kiln_llama::mock::MockEngine;
//!
//! let mut engine = MockEngine::new(128).with_script("ok");
//! let tokens = engine.tokenize("Hello", true, false).unwrap();
//!
//! let mut batch = LlamaBatch::new(tokens.len());
//! for (i, &token) in tokens.iter().enumerate() {
//!     batch.add(token, i as i32, &[0], i == tokens.len() - 1).unwrap();
//! }
//! engine.decode(&batch.view(0, batch.n_tokens())).unwrap();
//!
//! let mut sampler = SamplerChain::new(SamplingParams { temp: 0.0, ..Default::default() });
//! let next = sampler.sample(engine.logits(tokens.len() - 1), engine.token_nl());
//! assert_eq!(next, b'k' as i32);
//! ```

mod batch;
mod context_params;
mod engine;
mod error;
mod model_params;
mod sampling;
mod token;

pub mod mock;

pub use batch::{BatchPayload, BatchView, LlamaBatch};
pub use context_params::{LlamaContextParams, RopeScaling};
pub use engine::{ImageEncoder, LlamaEngine};
pub use error::LlamaError;
pub use model_params::{LlamaModelParams, MAX_DEVICES};
pub use sampling::{SamplerChain, SamplingParams, TokenData, LLAMA_DEFAULT_SEED};
pub use token::{LlamaPos, LlamaSeqId, LlamaToken};
