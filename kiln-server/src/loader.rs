//! Engine resolution for LoadModel.
//!
//! The decoder itself ships out-of-tree: deployments implement
//! [`kiln_llama::LlamaEngine`] and hand the server an [`EngineLoader`] for
//! it.  The built-in loader only knows the deterministic `mock` backend used
//! by the test suites and smoke runs.

use kiln_llama::mock::{MockEngine, MockImageEncoder};
use kiln_llama::LlamaEngine;

use crate::error::ServerError;
use crate::schemas::model::ModelOptions;

/// Resolves LoadModel options into a live engine.
pub trait EngineLoader: Send + Sync {
    fn load(&self, options: &ModelOptions) -> Result<Box<dyn LlamaEngine>, ServerError>;
}

/// The loader wired into the stock binary.
pub struct BuiltinLoader;

impl EngineLoader for BuiltinLoader {
    fn load(&self, options: &ModelOptions) -> Result<Box<dyn LlamaEngine>, ServerError> {
        let (model_params, ctx_params) = options.to_engine_params()?;
        tracing::debug!(
            n_gpu_layers = model_params.n_gpu_layers,
            n_ctx = ctx_params.n_ctx,
            n_batch = ctx_params.n_batch,
            threads = ctx_params.n_threads,
            "resolved engine parameters"
        );

        if options.model_file == "mock" || options.model_file.starts_with("mock:") {
            let mut engine = MockEngine::new(ctx_params.n_ctx);
            if ctx_params.embeddings {
                engine = engine.with_embeddings();
            }
            if options.mm_proj_path().is_some() {
                engine = engine.with_image_encoder(MockImageEncoder::default());
            }
            return Ok(Box::new(engine));
        }

        Err(ServerError::ModelLoad(format!(
            "no backend available for \"{}\"; link an engine and register it \
             through kiln_server::EngineLoader",
            options.model_file
        )))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mock_backend_loads() {
        let opts = ModelOptions {
            model_file: "mock".into(),
            context_size: 128,
            ..ModelOptions::default()
        };
        let engine = BuiltinLoader.load(&opts).unwrap();
        assert_eq!(engine.n_ctx(), 128);
        assert!(engine.image_encoder().is_none());
    }

    #[test]
    fn mock_backend_with_projector_is_multimodal() {
        let opts = ModelOptions {
            model_file: "mock".into(),
            mm_proj: "proj.bin".into(),
            ..ModelOptions::default()
        };
        let engine = BuiltinLoader.load(&opts).unwrap();
        assert!(engine.image_encoder().is_some());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let opts = ModelOptions {
            model_file: "/models/weights.gguf".into(),
            ..ModelOptions::default()
        };
        assert!(matches!(
            BuiltinLoader.load(&opts),
            Err(ServerError::ModelLoad(_))
        ));
    }
}
