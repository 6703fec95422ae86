use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::task::{
    CompletionRequest, ResultPayload, Task, TaskId, TaskKind, TaskResult,
};

/// The two mailboxes bridging RPC handler tasks and the scheduler thread.
///
/// Producers push tasks and poll results by id; the scheduler drains the
/// task queue at tick start and pushes results as slots produce them.  A
/// single [`Notify`] wakes every waiter whenever the result queue changes;
/// each waiter rescans for its own id, so interleaving with other tasks'
/// results is harmless.
pub struct TaskHub {
    tasks: Mutex<VecDeque<Task>>,
    results: Mutex<Vec<TaskResult>>,
    notify: Notify,
    id_gen: AtomicU64,
    shutdown: AtomicBool,
    failed: AtomicBool,
}

impl TaskHub {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            results: Mutex::new(Vec::new()),
            notify: Notify::new(),
            id_gen: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// Queue a completion task; returns the id its results will carry.
    pub fn request_completion(
        &self,
        request: CompletionRequest,
        infill: bool,
        embedding: bool,
    ) -> TaskId {
        let id = self.id_gen.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            id,
            kind: TaskKind::Completion {
                request: Box::new(request),
                infill,
                embedding,
            },
        };
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(task);
        id
    }

    /// Queue cancellation of a previously submitted task.
    pub fn request_cancel(&self, target_id: TaskId) {
        let id = self.id_gen.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(Task {
                id,
                kind: TaskKind::Cancel { target_id },
            });
    }

    /// Wait for the next result addressed to `task_id`.
    ///
    /// Results for one task are delivered in generation order; results for
    /// other tasks are left in place for their own waiters.
    pub async fn next_result(&self, task_id: TaskId) -> TaskResult {
        loop {
            // register interest before scanning so a push between the scan
            // and the await cannot be missed
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut results = self
                    .results
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(index) = results.iter().position(|res| res.id == task_id) {
                    return results.remove(index);
                }
            }
            if self.failed.load(Ordering::Acquire) {
                return TaskResult {
                    id: task_id,
                    stop: true,
                    error: true,
                    payload: ResultPayload::Error("inference runtime terminated".into()),
                };
            }
            notified.await;
        }
    }

    pub(crate) fn drain_tasks(&self) -> Vec<Task> {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.drain(..).collect()
    }

    pub(crate) fn push_result(&self, result: TaskResult) {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(result);
        self.notify.notify_waiters();
    }

    /// Flag the runtime as dead and wake every waiter.
    pub(crate) fn set_failed(&self) {
        self.failed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Drain every queued result regardless of task id.
    #[cfg(test)]
    pub(crate) fn take_results(&self) -> Vec<TaskResult> {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        results.drain(..).collect()
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::PartialPayload;

    fn partial(id: TaskId, content: &str) -> TaskResult {
        TaskResult {
            id,
            stop: false,
            error: false,
            payload: ResultPayload::Partial(PartialPayload {
                content: content.into(),
                ..PartialPayload::default()
            }),
        }
    }

    #[test]
    fn completion_ids_are_monotonic() {
        let hub = TaskHub::new();
        let a = hub.request_completion(CompletionRequest::default(), false, false);
        let b = hub.request_completion(CompletionRequest::default(), false, false);
        assert!(b > a);
        assert_eq!(hub.drain_tasks().len(), 2);
    }

    #[tokio::test]
    async fn next_result_skips_other_tasks() {
        let hub = TaskHub::new();
        hub.push_result(partial(7, "other"));
        hub.push_result(partial(3, "mine"));
        let res = hub.next_result(3).await;
        assert_eq!(res.content(), "mine");
        // the other task's result is still queued
        let res = hub.next_result(7).await;
        assert_eq!(res.content(), "other");
    }

    #[tokio::test]
    async fn next_result_preserves_order_for_one_task() {
        let hub = TaskHub::new();
        hub.push_result(partial(1, "a"));
        hub.push_result(partial(1, "b"));
        assert_eq!(hub.next_result(1).await.content(), "a");
        assert_eq!(hub.next_result(1).await.content(), "b");
    }

    #[tokio::test]
    async fn failed_hub_answers_waiters() {
        let hub = std::sync::Arc::new(TaskHub::new());
        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.next_result(42).await })
        };
        tokio::task::yield_now().await;
        hub.set_failed();
        let res = waiter.await.unwrap();
        assert!(res.error && res.stop);
    }
}
