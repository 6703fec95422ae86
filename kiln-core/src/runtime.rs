use std::sync::Arc;

use kiln_llama::LlamaEngine;

use crate::queue::TaskHub;
use crate::scheduler::Scheduler;
use crate::task::{CompletionRequest, TaskId, TaskResult};
use crate::CoreError;

/// Server-wide knobs for one loaded model.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of slots sharing the context window.
    pub n_parallel: usize,
    /// Decode chunk size.
    pub n_batch: usize,
    /// Server-wide generation limit (-1 = unlimited).
    pub n_predict: i32,
    /// Model name echoed in results.
    pub model_alias: String,
    /// Whether the context was created with embeddings enabled.
    pub embeddings: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            n_parallel: 1,
            n_batch: 512,
            n_predict: -1,
            model_alias: String::new(),
            embeddings: false,
        }
    }
}

/// Immutable facts about a launched runtime.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub n_parallel: usize,
    pub n_ctx: u32,
    pub n_ctx_slot: usize,
    pub n_embd: usize,
    pub model_alias: String,
    pub multimodal: bool,
}

/// The scheduler thread plus the mailboxes reaching into it.
pub struct ServerRuntime;

impl ServerRuntime {
    /// Build the slot pool and start the scheduler thread over `engine`.
    ///
    /// All further interaction goes through the returned [`ServerHandle`];
    /// dropping every handle leaves the thread running until
    /// [`ServerHandle::shutdown`] is called or the process exits.
    pub fn launch(
        engine: Box<dyn LlamaEngine>,
        config: RuntimeConfig,
    ) -> Result<ServerHandle, CoreError> {
        if config.n_parallel == 0 {
            return Err(CoreError::InvalidConfig("n_parallel must be > 0".into()));
        }

        let info = RuntimeInfo {
            n_parallel: config.n_parallel,
            n_ctx: engine.n_ctx(),
            n_ctx_slot: engine.n_ctx() as usize / config.n_parallel,
            n_embd: engine.n_embd(),
            model_alias: config.model_alias.clone(),
            multimodal: engine.image_encoder().is_some(),
        };

        let hub = Arc::new(TaskHub::new());
        let mut scheduler = Scheduler::new(engine, config, Arc::clone(&hub));

        std::thread::Builder::new()
            .name("kiln-scheduler".into())
            .spawn(move || scheduler.run())
            .map_err(CoreError::SpawnFailed)?;

        Ok(ServerHandle {
            hub,
            info: Arc::new(info),
        })
    }
}

/// Cloneable access point used by RPC handlers.
#[derive(Clone)]
pub struct ServerHandle {
    hub: Arc<TaskHub>,
    info: Arc<RuntimeInfo>,
}

impl ServerHandle {
    /// Queue a completion (or infill / embedding) task; returns its id.
    pub fn request_completion(
        &self,
        request: CompletionRequest,
        infill: bool,
        embedding: bool,
    ) -> TaskId {
        self.hub.request_completion(request, infill, embedding)
    }

    /// Ask the scheduler to release the slot bound to `task_id` at its next
    /// tick.
    pub fn request_cancel(&self, task_id: TaskId) {
        self.hub.request_cancel(task_id);
    }

    /// Wait for the next result addressed to `task_id`.
    pub async fn next_result(&self, task_id: TaskId) -> TaskResult {
        self.hub.next_result(task_id).await
    }

    /// Stop the scheduler thread after its current tick.
    pub fn shutdown(&self) {
        self.hub.request_shutdown();
    }

    /// Whether the scheduler died on a fatal decode error.
    pub fn is_failed(&self) -> bool {
        self.hub.is_failed()
    }

    pub fn info(&self) -> &RuntimeInfo {
        &self.info
    }
}
