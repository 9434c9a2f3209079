//! Task handles: the external view of one asynchronous computation.
//!
//! A [`Task<T>`] is move-only and single-owner: it is consumed by awaiting it
//! from another task, or by [`spawn`]ing it onto an executor. Awaiting yields
//! `Option<T>`, with `None` meaning the task finished cancelled, which is how
//! a nested cancellation surfaces to the caller as a plain boolean check.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::FutureExt as _;

use crate::runtime::executor::Executor;
use crate::runtime::promise::{TaskCore, TaskStatus, current_task, resume};

/// Handle to one asynchronous computation returning `T`.
///
/// Exactly one live handle exists per computation. The handle may be dropped
/// only while the task is Unstarted or already finished; dropping a suspended
/// task is a programming error.
pub struct Task<T> {
    core: Option<Arc<TaskCore>>,
    result: Arc<Mutex<Option<T>>>,
}

impl<T: Send + 'static> Task<T> {
    /// Wrap a future into an unstarted task. The future does not run until
    /// the task is awaited, spawned, or started as a subroutine.
    pub fn new(future: impl Future<Output = T> + Send + 'static) -> Self {
        let result: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        let core = TaskCore::new();
        core.install_frame(
            async move {
                let value = future.await;
                *slot.lock().expect("task result mutex poisoned") = Some(value);
            }
            .boxed(),
        );
        Task {
            core: Some(core),
            result,
        }
    }
}

impl<T> Task<T> {
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.core
            .as_ref()
            .map_or(TaskStatus::Done, |core| core.status())
    }

    fn consume(mut self) -> Arc<TaskCore> {
        self.core.take().expect("task handle already consumed")
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(core) = &self.core {
            debug_assert!(
                core.status() != TaskStatus::Suspended,
                "dropped a task handle while the task is suspended"
            );
        }
    }
}

/// Detach a task onto an executor. The task runs to completion there; its
/// cancellation does not propagate past the spawn boundary.
pub fn spawn(executor: &Executor, task: Task<()>) {
    let core = task.consume();
    core.bind_executor(executor);
    executor.enqueue(core);
}

/// Start a sibling task on the current executor and return its handle.
///
/// The subroutine begins running immediately, before this function returns.
/// If it completes synchronously the returned handle is already finished and
/// awaiting it is a no-op. Must be called from inside a running task.
pub fn start_subroutine<T>(task: Task<T>) -> Task<T> {
    let core = task
        .core
        .clone()
        .expect("task handle already consumed");
    core.bind_executor(&current_task().executor());
    resume(&core);
    task
}

/// Future produced by awaiting a [`Task`].
pub struct TaskAwait<T> {
    core: Option<Arc<TaskCore>>,
    result: Arc<Mutex<Option<T>>>,
    registered: bool,
}

impl<T> TaskAwait<T> {
    fn take_outcome(&mut self, core: &Arc<TaskCore>) -> Option<T> {
        self.core = None;
        match core.status() {
            TaskStatus::Cancelled => None,
            _ => self
                .result
                .lock()
                .expect("task result mutex poisoned")
                .take(),
        }
    }
}

impl<T> Future for TaskAwait<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let core = this
            .core
            .clone()
            .expect("task await polled after completion");

        match core.status() {
            TaskStatus::Done | TaskStatus::Cancelled => {
                return Poll::Ready(this.take_outcome(&core));
            }
            _ if this.registered => return Poll::Pending,
            TaskStatus::Unstarted => {
                let parent = current_task();
                core.bind_executor(&parent.executor());
                // Eager start: run the child here, synchronously, until it
                // either suspends or completes.
                resume(&core);
            }
            TaskStatus::Suspended => {}
        }

        // set_parent re-checks the status under the child's lock, so a
        // completion racing on another worker either sees our registration
        // or we see the final status here.
        if core.set_parent(current_task()) {
            this.registered = true;
            Poll::Pending
        } else {
            Poll::Ready(this.take_outcome(&core))
        }
    }
}

impl<T> IntoFuture for Task<T> {
    type Output = Option<T>;
    type IntoFuture = TaskAwait<T>;

    fn into_future(mut self) -> TaskAwait<T> {
        TaskAwait {
            core: self.core.take(),
            result: Arc::clone(&self.result),
            registered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::runtime::awaiter::cq_operation;
    use crate::runtime::executor::ExecutorThreadGroup;

    assert_impl_all!(Task<()>: Send);
    assert_impl_all!(Task<String>: Send);

    fn run_on_group<T: Send + 'static>(
        body: impl Future<Output = T> + Send + 'static,
    ) -> T {
        let mut group = ExecutorThreadGroup::default();
        let (sender, receiver) = crossbeam_channel::bounded(1);
        spawn(
            group.executor(),
            Task::new(async move {
                let value = body.await;
                let _ = sender.send(value);
            }),
        );
        let value = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("task did not finish in time");
        group.shutdown();
        value
    }

    #[test]
    fn synchronous_task_completes_without_suspending() {
        let value = run_on_group(async {
            let child = Task::new(async { 21 * 2 });
            child.await
        });
        assert_eq!(value, Some(42));
    }

    #[test]
    fn nested_awaits_lift_results_up_the_chain() {
        let value = run_on_group(async {
            let inner = Task::new(async { "deep".to_string() });
            let outer = Task::new(async move { inner.await.map(|s| format!("{s} result")) });
            outer.await.flatten()
        });
        assert_eq!(value.as_deref(), Some("deep result"));
    }

    #[test]
    fn failed_operation_cancels_the_task_and_surfaces_as_none() {
        let value = run_on_group(async {
            let child = Task::new(async {
                // An operation that immediately completes with ok=false.
                let ok = cq_operation(|queue, tag| queue.post(tag, false)).await;
                assert!(!ok);
            });
            child.await
        });
        // The child recovered nothing and finished cancelled.
        assert_eq!(value, None);
    }

    #[test]
    fn subroutine_starts_eagerly_and_can_be_awaited_later() {
        let value = run_on_group(async {
            let (started_tx, started_rx) = crossbeam_channel::bounded(1);
            let sub = start_subroutine(Task::new(async move {
                let _ = started_tx.send(());
                7
            }));
            // The subroutine ran before start_subroutine returned.
            assert!(started_rx.try_recv().is_ok());
            sub.await
        });
        assert_eq!(value, Some(7));
    }

    #[test]
    fn suspended_operation_resumes_with_ok() {
        let value = run_on_group(async {
            cq_operation(|queue, tag| {
                // Complete the operation from another thread after a delay,
                // like a transport would.
                let queue = Arc::clone(queue);
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    queue.post(tag, true);
                });
            })
            .await
        });
        assert!(value);
    }
}
