//! Awaiters that initiate a tagged operation and suspend until its
//! completion re-emerges from the queue.
//!
//! [`cq_operation`] is the workhorse: it captures a closure taking
//! `(queue, tag)`, runs it on first poll after registering the suspended
//! task under a fresh tag, and resolves to the operation's ok-bit when the
//! executor resumes the task. [`cq_initiate`] is the variant whose closure
//! also produces a call object; it resolves to `Some(call)` on success and
//! `None` when the framing bit came back false.
//!
//! Both are single-shot and move-only. A pending-operation latch in the
//! promise guards against a stray wake resolving an operation early.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::cq::{CqHandle, Tag, TagKind};
use crate::runtime::executor::Executor;
use crate::runtime::promise::current_task;

/// Initiate one tagged operation and await its ok-bit.
pub fn cq_operation<F>(op: F) -> CqOperation<F>
where
    F: FnOnce(&CqHandle, Tag),
{
    CqOperation {
        op: Some(op),
        target: None,
    }
}

/// Like [`cq_operation`], but posts the tag to `executor`'s queue and
/// re-binds the current task to it, so the task resumes over there. Used by
/// server listeners hopping between the pool's executors.
pub(crate) fn cq_operation_on<F>(executor: &Executor, op: F) -> CqOperation<F>
where
    F: FnOnce(&CqHandle, Tag),
{
    CqOperation {
        op: Some(op),
        target: Some(executor.clone()),
    }
}

pub struct CqOperation<F> {
    op: Option<F>,
    target: Option<Executor>,
}

// No self-references; the closure is stored by value and taken on first poll.
impl<F> Unpin for CqOperation<F> {}

impl<F> Future for CqOperation<F>
where
    F: FnOnce(&CqHandle, Tag),
{
    type Output = bool;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();
        let task = current_task();
        if let Some(op) = this.op.take() {
            if let Some(target) = this.target.take() {
                task.rebind_executor(&target);
            }
            let queue = task.executor().queue().clone();
            task.begin_operation();
            let tag = queue.register(task.clone(), TagKind::Operation);
            op(&queue, tag);
            Poll::Pending
        } else if task.operation_pending() {
            Poll::Pending
        } else {
            Poll::Ready(task.operation_ok())
        }
    }
}

/// Initiate an operation that yields a call object, awaiting
/// `Some(call)` on success or `None` on a false framing bit.
pub fn cq_initiate<F, R>(op: F) -> CqInitiate<F, R>
where
    F: FnOnce(&CqHandle, Tag) -> R,
{
    CqInitiate {
        op: Some(op),
        call: None,
    }
}

pub struct CqInitiate<F, R> {
    op: Option<F>,
    call: Option<R>,
}

impl<F, R> Unpin for CqInitiate<F, R> {}

impl<F, R> Future for CqInitiate<F, R>
where
    F: FnOnce(&CqHandle, Tag) -> R,
{
    type Output = Option<R>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let task = current_task();
        if let Some(op) = this.op.take() {
            let queue = task.executor().queue().clone();
            task.begin_operation();
            let tag = queue.register(task.clone(), TagKind::Operation);
            this.call = Some(op(&queue, tag));
            Poll::Pending
        } else if task.operation_pending() {
            Poll::Pending
        } else if task.operation_ok() {
            Poll::Ready(this.call.take())
        } else {
            Poll::Ready(None)
        }
    }
}
