use std::sync::Arc;

use kiln_core::ServerHandle;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::loader::EngineLoader;

/// Shared application state handed to every route handler.
pub struct AppState {
    pub config: Config,
    /// The launched runtime, present after a successful LoadModel.
    pub runtime: RwLock<Option<ServerHandle>>,
    /// Resolves ModelOptions into an engine implementation.
    pub loader: Arc<dyn EngineLoader>,
}

impl AppState {
    pub fn new(config: Config, loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            config,
            runtime: RwLock::new(None),
            loader,
        }
    }

    /// Clone out the current runtime handle, if a model is loaded.
    pub async fn handle(&self) -> Option<ServerHandle> {
        self.runtime.read().await.clone()
    }
}
