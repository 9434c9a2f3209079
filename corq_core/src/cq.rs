//! Completion queue and the tag protocol.
//!
//! Every in-flight operation deposits exactly one [`Tag`] with the queue it
//! will complete on. A tag is an opaque pointer-sized word; here it encodes a
//! key into the queue's registry of outstanding operations (plus a generation
//! counter so a stale post for a recycled key is ignored). The registry entry
//! is the control block referencing the suspended task, which is how the
//! executor finds the right coroutine to resume when the tag re-emerges from
//! [`CompletionQueue::next`] with its ok-bit.
//!
//! The queue outlives its producers and consumers gracefully: `shutdown`
//! flushes every outstanding tag with ok=false, late registrations complete
//! immediately with ok=false, and `next` keeps draining until both the ready
//! list and the registry are empty.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use slab::Slab;

use crate::runtime::promise::TaskCore;

/// Opaque pointer-sized word identifying one outstanding operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag(u64);

impl Tag {
    fn new(key: usize, generation: u32) -> Self {
        let key = u64::try_from(key).expect("tag registry key overflow");
        Tag((u64::from(generation) << 32) | key)
    }

    fn key(self) -> usize {
        usize::try_from(self.0 & 0xffff_ffff).expect("tag key exceeds usize")
    }

    fn generation(self) -> u32 {
        u32::try_from(self.0 >> 32).expect("tag generation exceeds u32")
    }
}

/// How the executor should treat a completed tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TagKind {
    /// An RPC operation: the ok-bit is written into the task's promise
    /// before the task is resumed.
    Operation,
    /// A bare resumption (spawn or waker): the ok-bit carries no meaning.
    Wake,
}

struct TagEntry {
    task: Arc<TaskCore>,
    kind: TagKind,
    generation: u32,
}

/// One completion pulled out of the queue.
pub(crate) struct Completion {
    pub tag: Tag,
    pub ok: bool,
    pub task: Arc<TaskCore>,
    pub kind: TagKind,
}

struct CqState {
    outstanding: Slab<TagEntry>,
    ready: VecDeque<Completion>,
    next_generation: u32,
    shut_down: bool,
}

/// An MPSC-like FIFO of completed operations, drained by one or more worker
/// threads.
pub struct CompletionQueue {
    state: Mutex<CqState>,
    readiness: Condvar,
}

/// Shared handle to a completion queue.
pub type CqHandle = Arc<CompletionQueue>;

impl CompletionQueue {
    pub(crate) fn new() -> CqHandle {
        Arc::new(CompletionQueue {
            state: Mutex::new(CqState {
                outstanding: Slab::with_capacity(64),
                ready: VecDeque::new(),
                next_generation: 0,
                shut_down: false,
            }),
            readiness: Condvar::new(),
        })
    }

    /// Register an outstanding operation for `task` and hand back the tag to
    /// deposit with the operation.
    ///
    /// After shutdown the tag completes immediately with ok=false, so a
    /// coroutine unwinding through a draining queue never hangs.
    pub(crate) fn register(&self, task: Arc<TaskCore>, kind: TagKind) -> Tag {
        let mut state = self.lock_state();
        let generation = state.next_generation;
        state.next_generation = state.next_generation.wrapping_add(1);
        let key = state.outstanding.insert(TagEntry {
            task,
            kind,
            generation,
        });
        let tag = Tag::new(key, generation);
        if state.shut_down {
            Self::complete_locked(&mut state, tag, false);
            self.readiness.notify_one();
        }
        tag
    }

    /// Post a completion for a previously registered tag.
    ///
    /// A stale tag (already flushed by shutdown, or from a recycled key) is
    /// ignored; the completion it referred to has already been delivered.
    pub fn post(&self, tag: Tag, ok: bool) {
        let mut state = self.lock_state();
        let current = state.outstanding.get(tag.key());
        if current.is_none_or(|entry| entry.generation != tag.generation()) {
            tracing::trace!(?tag, "ignoring stale completion");
            return;
        }
        Self::complete_locked(&mut state, tag, ok);
        drop(state);
        self.readiness.notify_one();
    }

    /// Enqueue a bare resumption for `task`, without an outstanding phase.
    /// Used by `spawn` and by task wakers.
    pub(crate) fn enqueue_resume(&self, task: Arc<TaskCore>) {
        let mut state = self.lock_state();
        state.ready.push_back(Completion {
            tag: Tag::new(0, 0),
            ok: true,
            task,
            kind: TagKind::Wake,
        });
        drop(state);
        self.readiness.notify_one();
    }

    /// Block until a completion is available, or until the queue is shut
    /// down and fully drained (then `None`).
    pub(crate) fn next(&self) -> Option<Completion> {
        let mut state = self.lock_state();
        loop {
            if let Some(completion) = state.ready.pop_front() {
                return Some(completion);
            }
            if state.shut_down && state.outstanding.is_empty() {
                return None;
            }
            state = self
                .readiness
                .wait(state)
                .expect("completion queue mutex poisoned");
        }
    }

    /// Signal the queue to drain. Every outstanding tag completes with
    /// ok=false. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        let keys: Vec<usize> = state.outstanding.iter().map(|(key, _)| key).collect();
        tracing::debug!(outstanding = keys.len(), "completion queue shutting down");
        for key in keys {
            let generation = state.outstanding[key].generation;
            Self::complete_locked(&mut state, Tag::new(key, generation), false);
        }
        drop(state);
        self.readiness.notify_all();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.lock_state().shut_down
    }

    fn complete_locked(state: &mut CqState, tag: Tag, ok: bool) {
        let entry = state.outstanding.remove(tag.key());
        state.ready.push_back(Completion {
            tag,
            ok,
            task: entry.task,
            kind: entry.kind,
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CqState> {
        self.state
            .lock()
            .expect("completion queue mutex poisoned")
    }
}
