//! Server side of the in-proc transport: accept matchmaking and shutdown.
//!
//! Each registered method has a mailbox holding whichever side arrived
//! first: accept operations waiting for calls, or calls waiting for an
//! accept. Matching a pair fills the accept's seat with the call (and, for
//! unary and server-stream methods, the staged request payload) and posts
//! the accept tag with ok=true. Closing the transport resolves every
//! pending and future accept with ok=false, which is what breaks the
//! listener loops.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Instant;

use crate::cq::{CqHandle, Tag};
use crate::inproc::call::CallShared;
use crate::inproc::context::Metadata;
use crate::server::ServerError;
use crate::service::{MethodDescriptor, MethodKind};
use crate::status::{Status, StatusCode};

/// A matched call handed to a listener through its accept seat.
pub(crate) struct AcceptedCall {
    pub shared: Arc<CallShared>,
    /// Staged request payload for unary and server-stream methods.
    pub request: Option<Vec<u8>>,
    pub metadata: Metadata,
}

/// Where a pending accept receives its matched call.
pub(crate) type AcceptSeat = Arc<Mutex<Option<AcceptedCall>>>;

struct PendingAccept {
    seat: AcceptSeat,
    queue: CqHandle,
    tag: Tag,
}

struct OfferedCall {
    shared: Arc<CallShared>,
    metadata: Metadata,
}

struct MethodMailbox {
    kind: MethodKind,
    accepts: VecDeque<PendingAccept>,
    calls: VecDeque<OfferedCall>,
}

pub(crate) struct ServerTransport {
    mailboxes: Mutex<HashMap<String, MethodMailbox>>,
    closed: AtomicBool,
    active: Arc<ActiveCalls>,
}

impl ServerTransport {
    pub(crate) fn new() -> Arc<ServerTransport> {
        Arc::new(ServerTransport {
            mailboxes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            active: Arc::new(ActiveCalls::default()),
        })
    }

    pub(crate) fn add_method(
        &self,
        method: &MethodDescriptor,
    ) -> Result<(), ServerError> {
        let mut mailboxes = self.lock_mailboxes();
        let path = method.path();
        if mailboxes.contains_key(&path) {
            return Err(ServerError::DuplicateMethod(path));
        }
        mailboxes.insert(
            path,
            MethodMailbox {
                kind: method.kind,
                accepts: VecDeque::new(),
                calls: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Client side offers a freshly created call for this method.
    pub(crate) fn offer(
        &self,
        method: &MethodDescriptor,
        shared: &Arc<CallShared>,
        metadata: Metadata,
    ) {
        if self.closed.load(Ordering::Acquire) {
            shared.fail_unserved(Status::new(
                StatusCode::Unavailable,
                "server is shutting down",
            ));
            return;
        }
        shared.set_active_guard(self.active.acquire(shared));

        let mut mailboxes = self.lock_mailboxes();
        // Re-checked under the mailbox lock: shutdown flips the flag before
        // draining, so a call offered concurrently either lands in the
        // drain or fails here.
        if self.closed.load(Ordering::Acquire) {
            drop(mailboxes);
            shared.fail_unserved(Status::new(
                StatusCode::Unavailable,
                "server is shutting down",
            ));
            return;
        }
        let Some(mailbox) = mailboxes.get_mut(&method.path()) else {
            drop(mailboxes);
            shared.fail_unserved(Status::new(
                StatusCode::NotFound,
                format!("unknown method {}", method.path()),
            ));
            return;
        };
        if let Some(accept) = mailbox.accepts.pop_front() {
            let kind = mailbox.kind;
            drop(mailboxes);
            Self::seat_call(&accept, Arc::clone(shared), metadata, kind);
        } else {
            mailbox.calls.push_back(OfferedCall {
                shared: Arc::clone(shared),
                metadata,
            });
        }
    }

    /// Listener side requests the next call for `method`; the tag fires
    /// when a client initiates one, or with ok=false at shutdown.
    pub(crate) fn request_call(
        &self,
        method: &MethodDescriptor,
        seat: AcceptSeat,
        queue: &CqHandle,
        tag: Tag,
    ) {
        if self.closed.load(Ordering::Acquire) {
            queue.post(tag, false);
            return;
        }
        let mut mailboxes = self.lock_mailboxes();
        if self.closed.load(Ordering::Acquire) {
            drop(mailboxes);
            queue.post(tag, false);
            return;
        }
        let mailbox = mailboxes
            .get_mut(&method.path())
            .expect("listening on a method the server never registered");
        if let Some(call) = mailbox.calls.pop_front() {
            let kind = mailbox.kind;
            drop(mailboxes);
            Self::seat_call(
                &PendingAccept {
                    seat,
                    queue: Arc::clone(queue),
                    tag,
                },
                call.shared,
                call.metadata,
                kind,
            );
        } else {
            mailbox.accepts.push_back(PendingAccept {
                seat,
                queue: Arc::clone(queue),
                tag,
            });
        }
    }

    /// Stop accepting calls and wait for in-flight ones to drain. With a
    /// deadline, calls still running at the deadline are cancelled.
    pub(crate) fn shutdown(&self, deadline: Option<Instant>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut drained_accepts = Vec::new();
        let mut drained_calls = Vec::new();
        {
            let mut mailboxes = self.lock_mailboxes();
            for mailbox in mailboxes.values_mut() {
                drained_accepts.extend(mailbox.accepts.drain(..));
                drained_calls.extend(mailbox.calls.drain(..));
            }
        }
        tracing::debug!(
            pending_accepts = drained_accepts.len(),
            unserved_calls = drained_calls.len(),
            "server transport closing"
        );
        for accept in drained_accepts {
            accept.queue.post(accept.tag, false);
        }
        for call in drained_calls {
            call.shared.fail_unserved(Status::new(
                StatusCode::Unavailable,
                "server is shutting down",
            ));
        }
        if !self.active.wait_drained(deadline) {
            tracing::debug!("shutdown deadline reached, cancelling in-flight calls");
            self.active.cancel_live();
        }
    }

    fn seat_call(
        accept: &PendingAccept,
        shared: Arc<CallShared>,
        metadata: Metadata,
        kind: MethodKind,
    ) {
        let request = match kind {
            MethodKind::Unary | MethodKind::ServerStream => shared.take_first_inbound(),
            MethodKind::ClientStream | MethodKind::BidiStream => None,
        };
        *accept.seat.lock().expect("accept seat mutex poisoned") = Some(AcceptedCall {
            shared,
            request,
            metadata,
        });
        accept.queue.post(accept.tag, true);
    }

    fn lock_mailboxes(&self) -> MutexGuard<'_, HashMap<String, MethodMailbox>> {
        self.mailboxes
            .lock()
            .expect("server mailbox mutex poisoned")
    }
}

/// Book-keeping of calls a server has accepted responsibility for.
///
/// A guard is acquired when a call is offered and released when the call
/// reaches a terminal state (finish, cancel, or unserved failure), so
/// shutdown can wait for the count to reach zero.
#[derive(Default)]
struct ActiveState {
    count: usize,
    live: Vec<Weak<CallShared>>,
}

#[derive(Default)]
pub(crate) struct ActiveCalls {
    state: Mutex<ActiveState>,
    drained: Condvar,
}

impl ActiveCalls {
    fn acquire(self: &Arc<Self>, call: &Arc<CallShared>) -> ActiveCallGuard {
        let mut state = self.lock_state();
        state.count += 1;
        if state.live.len() >= 32 && state.live.len() >= state.count * 2 {
            state.live.retain(|weak| weak.strong_count() > 0);
        }
        state.live.push(Arc::downgrade(call));
        ActiveCallGuard {
            calls: Arc::clone(self),
        }
    }

    fn wait_drained(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.lock_state();
        loop {
            if state.count == 0 {
                return true;
            }
            match deadline {
                None => {
                    state = self
                        .drained
                        .wait(state)
                        .expect("active call mutex poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, _) = self
                        .drained
                        .wait_timeout(state, deadline - now)
                        .expect("active call mutex poisoned");
                    state = next;
                }
            }
        }
    }

    fn cancel_live(&self) {
        let live: Vec<Arc<CallShared>> = {
            let mut state = self.lock_state();
            state.live.drain(..).filter_map(|weak| weak.upgrade()).collect()
        };
        for call in live {
            call.cancel();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ActiveState> {
        self.state.lock().expect("active call mutex poisoned")
    }
}

pub(crate) struct ActiveCallGuard {
    calls: Arc<ActiveCalls>,
}

impl Drop for ActiveCallGuard {
    fn drop(&mut self) {
        let mut state = self.calls.lock_state();
        state.count -= 1;
        if state.count == 0 {
            state.live.clear();
            drop(state);
            self.calls.drained.notify_all();
        }
    }
}
