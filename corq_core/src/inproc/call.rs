//! Per-call wire state shared between the client and server ends.
//!
//! A call is two message queues (one per direction), a writes-done flag, a
//! terminal status slot, and a cancelled flag. Each side may park at most one
//! read and the client may park one finish; whichever side arrives second
//! fulfils the parked operation by posting its tag. All completion rules
//! follow the queue semantics the call wrappers rely on: reads resolve
//! ok=false at end-of-stream, every parked operation resolves ok=false on
//! cancellation, and a finish resolves ok=true carrying the server's status.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cq::{CqHandle, Tag};
use crate::inproc::server::ActiveCallGuard;
use crate::status::Status;

/// Slot a pending read's payload is delivered through.
pub(crate) type ByteSlot = Arc<Mutex<Option<Vec<u8>>>>;
/// Slot a finish operation's status is delivered through.
pub(crate) type StatusSlot = Arc<Mutex<Option<Status>>>;

struct PendingOp {
    queue: CqHandle,
    tag: Tag,
}

impl PendingOp {
    fn new(queue: &CqHandle, tag: Tag) -> Self {
        PendingOp {
            queue: Arc::clone(queue),
            tag,
        }
    }

    fn post(self, ok: bool) {
        self.queue.post(self.tag, ok);
    }
}

struct PendingRead {
    slot: ByteSlot,
    op: PendingOp,
}

struct PendingFinish {
    response: Option<ByteSlot>,
    status: StatusSlot,
    op: PendingOp,
}

#[derive(Default)]
struct CallWire {
    /// Client → server messages not yet read by the server.
    inbound: VecDeque<Vec<u8>>,
    client_done: bool,
    /// Server → client messages not yet read by the client.
    outbound: VecDeque<Vec<u8>>,
    finished: Option<Status>,
    cancelled: bool,
    server_read: Option<PendingRead>,
    client_read: Option<PendingRead>,
    client_finish: Option<PendingFinish>,
    active: Option<ActiveCallGuard>,
}

pub(crate) struct CallShared {
    wire: Mutex<CallWire>,
}

impl CallShared {
    pub(crate) fn new() -> Arc<CallShared> {
        Arc::new(CallShared {
            wire: Mutex::new(CallWire::default()),
        })
    }

    /// Stage the initial request message before the call is offered to a
    /// server (unary and server-stream calls).
    pub(crate) fn push_initial(&self, bytes: Vec<u8>) {
        self.lock().inbound.push_back(bytes);
    }

    /// Close the client's write stream at creation (unary calls).
    pub(crate) fn mark_writes_done(&self) {
        self.lock().client_done = true;
    }

    pub(crate) fn set_active_guard(&self, guard: ActiveCallGuard) {
        self.lock().active = Some(guard);
    }

    /// Pop the staged request for delivery with the accept notification.
    pub(crate) fn take_first_inbound(&self) -> Option<Vec<u8>> {
        self.lock().inbound.pop_front()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub(crate) fn has_parked_client_ops(&self) -> bool {
        let wire = self.lock();
        wire.client_read.is_some() || wire.client_finish.is_some()
    }

    /// Terminate a call no server will handle: the status is delivered
    /// through the finish path, reads end, nothing raises.
    pub(crate) fn fail_unserved(&self, status: Status) {
        let mut wire = self.lock();
        if wire.finished.is_some() || wire.cancelled {
            return;
        }
        wire.finished = Some(status.clone());
        if let Some(read) = wire.client_read.take() {
            read.op.post(false);
        }
        if let Some(finish) = wire.client_finish.take() {
            Self::fulfil_finish(&mut wire, finish, status);
        }
        wire.active.take();
    }

    /// Cancel the call: every parked operation resolves ok=false and every
    /// subsequent operation fails. Idempotent.
    pub(crate) fn cancel(&self) {
        let mut wire = self.lock();
        if wire.cancelled {
            return;
        }
        wire.cancelled = true;
        if let Some(read) = wire.server_read.take() {
            read.op.post(false);
        }
        if let Some(read) = wire.client_read.take() {
            read.op.post(false);
        }
        if let Some(finish) = wire.client_finish.take() {
            finish.op.post(false);
        }
        wire.active.take();
    }

    // Client-side operations

    pub(crate) fn client_write(&self, bytes: Vec<u8>, queue: &CqHandle, tag: Tag) {
        let mut wire = self.lock();
        if wire.cancelled || wire.finished.is_some() || wire.client_done {
            queue.post(tag, false);
            return;
        }
        wire.inbound.push_back(bytes);
        if let Some(read) = wire.server_read.take() {
            let message = wire.inbound.pop_front().expect("just pushed");
            *read.slot.lock().expect("read slot mutex poisoned") = Some(message);
            read.op.post(true);
        }
        queue.post(tag, true);
    }

    pub(crate) fn client_writes_done(&self, queue: &CqHandle, tag: Tag) {
        let mut wire = self.lock();
        if wire.cancelled || wire.client_done {
            queue.post(tag, false);
            return;
        }
        wire.client_done = true;
        if let Some(read) = wire.server_read.take() {
            read.op.post(false);
        }
        queue.post(tag, true);
    }

    pub(crate) fn client_read(&self, slot: ByteSlot, queue: &CqHandle, tag: Tag) {
        let mut wire = self.lock();
        if let Some(message) = wire.outbound.pop_front() {
            *slot.lock().expect("read slot mutex poisoned") = Some(message);
            queue.post(tag, true);
        } else if wire.finished.is_some() || wire.cancelled {
            queue.post(tag, false);
        } else {
            debug_assert!(wire.client_read.is_none(), "one client read at a time");
            wire.client_read = Some(PendingRead {
                slot,
                op: PendingOp::new(queue, tag),
            });
        }
    }

    pub(crate) fn client_finish(
        &self,
        response: Option<ByteSlot>,
        status: StatusSlot,
        queue: &CqHandle,
        tag: Tag,
    ) {
        let mut wire = self.lock();
        if wire.cancelled {
            queue.post(tag, false);
            return;
        }
        let pending = PendingFinish {
            response,
            status,
            op: PendingOp::new(queue, tag),
        };
        if let Some(terminal) = wire.finished.clone() {
            Self::fulfil_finish(&mut wire, pending, terminal);
        } else {
            debug_assert!(wire.client_finish.is_none(), "one client finish at a time");
            wire.client_finish = Some(pending);
        }
    }

    // Server-side operations

    pub(crate) fn server_read(&self, slot: ByteSlot, queue: &CqHandle, tag: Tag) {
        let mut wire = self.lock();
        if let Some(message) = wire.inbound.pop_front() {
            *slot.lock().expect("read slot mutex poisoned") = Some(message);
            queue.post(tag, true);
        } else if wire.client_done || wire.cancelled {
            queue.post(tag, false);
        } else {
            debug_assert!(wire.server_read.is_none(), "one server read at a time");
            wire.server_read = Some(PendingRead {
                slot,
                op: PendingOp::new(queue, tag),
            });
        }
    }

    pub(crate) fn server_write(&self, bytes: Vec<u8>, queue: &CqHandle, tag: Tag) {
        let mut wire = self.lock();
        if wire.cancelled || wire.finished.is_some() {
            queue.post(tag, false);
            return;
        }
        Self::deliver_to_client(&mut wire, bytes);
        queue.post(tag, true);
    }

    /// Finish the call, optionally delivering one trailing message first
    /// (write-and-finish).
    pub(crate) fn server_finish(
        &self,
        trailing: Option<Vec<u8>>,
        status: Status,
        queue: &CqHandle,
        tag: Tag,
    ) {
        let mut wire = self.lock();
        if wire.cancelled || wire.finished.is_some() {
            wire.active.take();
            queue.post(tag, false);
            return;
        }
        if let Some(bytes) = trailing {
            Self::deliver_to_client(&mut wire, bytes);
        }
        wire.finished = Some(status.clone());
        if let Some(read) = wire.client_read.take() {
            read.op.post(false);
        }
        if let Some(finish) = wire.client_finish.take() {
            Self::fulfil_finish(&mut wire, finish, status);
        }
        wire.active.take();
        queue.post(tag, true);
    }

    fn deliver_to_client(wire: &mut CallWire, bytes: Vec<u8>) {
        if let Some(read) = wire.client_read.take() {
            *read.slot.lock().expect("read slot mutex poisoned") = Some(bytes);
            read.op.post(true);
        } else {
            wire.outbound.push_back(bytes);
        }
    }

    fn fulfil_finish(wire: &mut CallWire, finish: PendingFinish, status: Status) {
        if let Some(slot) = finish.response {
            *slot.lock().expect("response slot mutex poisoned") = wire.outbound.pop_front();
        }
        *finish.status.lock().expect("status slot mutex poisoned") = Some(status);
        finish.op.post(true);
    }

    fn lock(&self) -> MutexGuard<'_, CallWire> {
        self.wire.lock().expect("call state mutex poisoned")
    }
}
