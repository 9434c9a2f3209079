//! Executors pump one completion queue each and resume the tasks whose tags
//! come out of it.
//!
//! Any number of worker threads may drive the same executor; per-coroutine
//! serialization comes from the tag protocol (at most one outstanding tag
//! per coroutine) and the promise scheduling word, not from the executor.

use std::sync::Arc;
use std::thread;

use crate::cq::{CompletionQueue, CqHandle, TagKind};
use crate::runtime::promise::{TaskCore, resume};
use crate::runtime::task::Task;

/// Default number of worker threads per executor.
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Handle to an executor owning one completion queue.
#[derive(Clone)]
pub struct Executor {
    queue: CqHandle,
}

impl Executor {
    #[must_use]
    pub fn new() -> Self {
        Executor {
            queue: CompletionQueue::new(),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &CqHandle {
        &self.queue
    }

    /// Block on one completion, drive one resumption. Returns false once the
    /// queue has shut down and drained.
    pub fn poll(&self) -> bool {
        let Some(completion) = self.queue.next() else {
            return false;
        };
        tracing::trace!(tag = ?completion.tag, ok = completion.ok, "completion pulled");
        if completion.kind == TagKind::Operation {
            completion.task.complete_operation(completion.ok);
        }
        resume(&completion.task);
        true
    }

    /// Signal the queue to drain; outstanding tags complete with ok=false.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Detach a task onto this executor.
    pub fn spawn(&self, task: Task<()>) {
        crate::runtime::task::spawn(self, task);
    }

    pub(crate) fn enqueue(&self, core: Arc<TaskCore>) {
        self.queue.enqueue_resume(core);
    }

    pub(crate) fn same_queue(&self, other: &Executor) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue)
    }
}

impl Default for Executor {
    fn default() -> Self {
        Executor::new()
    }
}

/// An executor whose queue also carries server-side new-call notifications.
///
/// Externally identical to [`Executor`]; the call queue and the notification
/// queue are views of the same underlying queue in this design.
#[derive(Clone)]
pub struct ServerExecutor {
    inner: Executor,
}

impl ServerExecutor {
    #[must_use]
    pub fn new() -> Self {
        ServerExecutor {
            inner: Executor::new(),
        }
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.inner
    }

    #[must_use]
    pub fn call_queue(&self) -> &CqHandle {
        self.inner.queue()
    }

    #[must_use]
    pub fn notification_queue(&self) -> &CqHandle {
        self.inner.queue()
    }

    pub fn poll(&self) -> bool {
        self.inner.poll()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn spawn(&self, task: Task<()>) {
        self.inner.spawn(task);
    }
}

impl Default for ServerExecutor {
    fn default() -> Self {
        ServerExecutor::new()
    }
}

/// One executor driven by a set of worker threads.
///
/// Dropping the group shuts the executor down and joins the workers.
pub struct ExecutorThreadGroup {
    executor: Executor,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ExecutorThreadGroup {
    #[must_use]
    pub fn new(thread_count: usize) -> Self {
        Self::with_executor(Executor::new(), thread_count)
    }

    #[must_use]
    pub fn with_executor(executor: Executor, thread_count: usize) -> Self {
        let workers = (0..thread_count)
            .map(|index| {
                let executor = executor.clone();
                thread::Builder::new()
                    .name(format!("cq-worker-{index}"))
                    .spawn(move || {
                        tracing::trace!("worker started");
                        while executor.poll() {}
                        tracing::trace!("worker exiting, queue drained");
                    })
                    .expect("failed to spawn completion queue worker")
            })
            .collect();
        ExecutorThreadGroup { executor, workers }
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Shut the executor down and join all workers. Idempotent.
    pub fn shutdown(&mut self) {
        self.executor.shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("completion queue worker panicked");
            }
        }
    }
}

impl Default for ExecutorThreadGroup {
    fn default() -> Self {
        ExecutorThreadGroup::new(DEFAULT_WORKER_THREADS)
    }
}

impl Drop for ExecutorThreadGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Executor: Send, Sync);
    assert_impl_all!(ServerExecutor: Send, Sync);

    #[test]
    fn poll_returns_false_after_shutdown_drains() {
        let executor = Executor::new();
        executor.shutdown();
        assert!(!executor.poll());
        // shutdown is idempotent
        executor.shutdown();
        assert!(!executor.poll());
    }

    #[test]
    fn server_executor_views_share_one_queue() {
        let executor = ServerExecutor::new();
        assert!(Arc::ptr_eq(
            executor.call_queue(),
            executor.notification_queue()
        ));
    }

    #[test]
    fn thread_group_joins_workers_on_shutdown() {
        let mut group = ExecutorThreadGroup::new(3);
        group.shutdown();
        group.shutdown();
        assert!(group.workers.is_empty());
    }
}
