//! The per-task promise control block and the resume state machine.
//!
//! Each task owns one [`TaskCore`]: the boxed future frame, the status tag,
//! the cancelled bit written by operation completions, the optional parent
//! link, and the executor the task is bound to. The executor and the awaiters
//! never touch the frame directly; everything goes through [`resume`], which
//! serializes polling with a small atomic scheduling word.
//!
//! The scheduling word has four states. IDLE: nobody is polling. POLLING: one
//! thread owns the frame. NOTIFIED: a completion arrived while the owner was
//! polling, so the owner re-polls before releasing. DONE: the frame has been
//! destroyed. A completion can therefore land on any worker thread at any
//! moment without ever polling a frame concurrently or losing a resumption.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::ArcWake;

use crate::runtime::executor::Executor;

/// Externally observable task state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created, never resumed.
    Unstarted,
    /// Resumed at least once, currently parked on an operation.
    Suspended,
    /// Ran to completion normally.
    Done,
    /// Ran to completion with the cancelled bit set (last operation failed
    /// at the framing layer, or the body panicked).
    Cancelled,
}

const IDLE: u8 = 0;
const POLLING: u8 = 1;
const NOTIFIED: u8 = 2;
const DONE: u8 = 3;

struct Inner {
    status: TaskStatus,
    parent: Option<Arc<TaskCore>>,
}

pub(crate) struct TaskCore {
    frame: Mutex<Option<BoxFuture<'static, ()>>>,
    inner: Mutex<Inner>,
    sched: AtomicU8,
    cancelled: AtomicBool,
    op_pending: AtomicBool,
    executor: Mutex<Option<Executor>>,
}

impl TaskCore {
    pub(crate) fn new() -> Arc<TaskCore> {
        Arc::new(TaskCore {
            frame: Mutex::new(None),
            inner: Mutex::new(Inner {
                status: TaskStatus::Unstarted,
                parent: None,
            }),
            sched: AtomicU8::new(IDLE),
            cancelled: AtomicBool::new(false),
            op_pending: AtomicBool::new(false),
            executor: Mutex::new(None),
        })
    }

    pub(crate) fn install_frame(&self, frame: BoxFuture<'static, ()>) {
        *self.lock_frame() = Some(frame);
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.lock_inner().status
    }

    /// Register `parent` to be resumed when this task completes, unless it
    /// already has. Returns false if the task is already Done/Cancelled (the
    /// caller should read the outcome instead of suspending).
    pub(crate) fn set_parent(&self, parent: Arc<TaskCore>) -> bool {
        let mut inner = self.lock_inner();
        match inner.status {
            TaskStatus::Done | TaskStatus::Cancelled => false,
            _ => {
                debug_assert!(inner.parent.is_none(), "task awaited by two parents");
                inner.parent = Some(parent);
                true
            }
        }
    }

    /// Bind the task to an executor. A second bind to the same executor is a
    /// no-op; binding an already-bound task to a different executor is the
    /// listener hop and is done explicitly via [`TaskCore::rebind_executor`].
    pub(crate) fn bind_executor(&self, executor: &Executor) {
        let mut slot = self.lock_executor();
        match &*slot {
            Some(bound) => debug_assert!(
                bound.same_queue(executor),
                "task is already bound to a different executor"
            ),
            None => *slot = Some(executor.clone()),
        }
    }

    pub(crate) fn rebind_executor(&self, executor: &Executor) {
        *self.lock_executor() = Some(executor.clone());
    }

    pub(crate) fn executor(&self) -> Executor {
        self.lock_executor()
            .clone()
            .expect("task is not bound to an executor")
    }

    /// Mark the start of a tagged operation; cleared by the completion.
    pub(crate) fn begin_operation(&self) {
        self.op_pending.store(true, Ordering::Release);
    }

    /// Write the ok-bit of a completed operation into the promise.
    pub(crate) fn complete_operation(&self, ok: bool) {
        self.cancelled.store(!ok, Ordering::Relaxed);
        self.op_pending.store(false, Ordering::Release);
    }

    pub(crate) fn operation_pending(&self) -> bool {
        self.op_pending.load(Ordering::Acquire)
    }

    pub(crate) fn operation_ok(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
    }

    fn try_begin_poll(&self) -> bool {
        loop {
            match self
                .sched
                .compare_exchange(IDLE, POLLING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(POLLING) => {
                    match self.sched.compare_exchange(
                        POLLING,
                        NOTIFIED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        // The polling thread will observe the notification
                        // and re-poll before releasing.
                        Ok(_) => return false,
                        Err(IDLE | POLLING) => {}
                        Err(_) => return false,
                    }
                }
                Err(NOTIFIED) => return false,
                Err(_) => return false,
            }
        }
    }

    /// Release the POLLING claim after a Pending poll. Returns true if a
    /// notification arrived mid-poll and the caller must poll again.
    fn yield_poll(&self) -> bool {
        match self
            .sched
            .compare_exchange(POLLING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(NOTIFIED) => {
                self.sched.store(POLLING, Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    /// Poll the frame once. Returns true when the task has finished (normal
    /// return or contained panic).
    fn poll_frame_once(self: &Arc<Self>) -> bool {
        let waker = futures::task::waker(Arc::new(TaskWaker {
            task: Arc::clone(self),
        }));
        let mut cx = Context::from_waker(&waker);

        let mut frame = self.lock_frame();
        let Some(future) = frame.as_mut() else {
            return true;
        };

        let _scope = CurrentTaskScope::enter(Arc::clone(self));
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {
                self.lock_inner().status = TaskStatus::Suspended;
                false
            }
            Ok(Poll::Ready(())) => true,
            Err(panic) => {
                let message = panic_message(&panic);
                tracing::error!(panic = %message, "task body panicked, marking it cancelled");
                self.cancelled.store(true, Ordering::Release);
                true
            }
        }
    }

    /// Finalize a finished task: record the status, destroy the frame, and
    /// hand back the parent (with the cancelled bit propagated) so the
    /// resume loop can continue iteratively.
    fn complete(&self) -> Option<Arc<TaskCore>> {
        *self.lock_frame() = None;
        let cancelled = self.cancelled.load(Ordering::Acquire);
        let parent = {
            let mut inner = self.lock_inner();
            inner.status = if cancelled {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Done
            };
            inner.parent.take()
        };
        self.sched.store(DONE, Ordering::Release);
        if cancelled {
            if let Some(parent) = &parent {
                parent.cancelled.store(true, Ordering::Release);
            }
        }
        parent
    }

    fn lock_frame(&self) -> MutexGuard<'_, Option<BoxFuture<'static, ()>>> {
        self.frame.lock().expect("task frame mutex poisoned")
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("task state mutex poisoned")
    }

    fn lock_executor(&self) -> MutexGuard<'_, Option<Executor>> {
        self.executor.lock().expect("task executor mutex poisoned")
    }
}

/// Drive `task` until it settles, then walk the parent chain.
///
/// Expressed as a loop rather than recursion so an arbitrarily deep chain of
/// completing coroutines consumes no stack.
pub(crate) fn resume(task: &Arc<TaskCore>) {
    let mut current = Arc::clone(task);
    loop {
        if !current.try_begin_poll() {
            return;
        }
        let finished = loop {
            if current.poll_frame_once() {
                break true;
            }
            if !current.yield_poll() {
                break false;
            }
        };
        if !finished {
            return;
        }
        match current.complete() {
            Some(parent) => current = parent,
            None => return,
        }
    }
}

struct TaskWaker {
    task: Arc<TaskCore>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let executor = arc_self.task.lock_executor().clone();
        if let Some(executor) = executor {
            executor.enqueue(Arc::clone(&arc_self.task));
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Vec<Arc<TaskCore>>> = const { RefCell::new(Vec::new()) };
}

/// The task currently being polled on this thread. Awaiters use this to
/// reach the promise of the coroutine suspending on them, the way the
/// suspension hook of a coroutine receives its promise.
pub(crate) fn current_task() -> Arc<TaskCore> {
    CURRENT
        .with(|stack| stack.borrow().last().cloned())
        .expect("not inside a task; this operation must be awaited from a task on an executor")
}

struct CurrentTaskScope;

impl CurrentTaskScope {
    fn enter(task: Arc<TaskCore>) -> CurrentTaskScope {
        CURRENT.with(|stack| stack.borrow_mut().push(task));
        CurrentTaskScope
    }
}

impl Drop for CurrentTaskScope {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
