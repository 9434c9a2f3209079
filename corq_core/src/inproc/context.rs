//! Client and server call contexts.
//!
//! A context carries per-call metadata and a cooperative cancellation entry
//! point. A client context is created fresh for each call attempt (see the
//! retry loop's context provider); cancelling it resolves every in-flight
//! operation on its call with a false framing bit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::inproc::call::CallShared;

/// Per-call key/value metadata.
pub type Metadata = BTreeMap<String, String>;

/// Client-side call context: metadata plus cooperative cancellation.
pub struct ClientContext {
    metadata: Metadata,
    inner: Arc<ContextInner>,
}

struct ContextInner {
    cancelled: AtomicBool,
    call: Mutex<Option<Arc<CallShared>>>,
}

impl ClientContext {
    #[must_use]
    pub fn new() -> Self {
        ClientContext {
            metadata: Metadata::new(),
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                call: Mutex::new(None),
            }),
        }
    }

    /// Attach a metadata entry sent to the server with the call.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Request cancellation of the call made with this context. In-flight
    /// operations resume with a false framing bit. Safe to call from any
    /// thread, before or during the call.
    pub fn try_cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        if let Some(call) = self.lock_call().as_ref() {
            call.cancel();
        }
    }

    pub(crate) fn attach(&self, call: &Arc<CallShared>) {
        *self.lock_call() = Some(Arc::clone(call));
        if self.inner.cancelled.load(Ordering::Acquire) {
            call.cancel();
        }
    }

    fn lock_call(&self) -> MutexGuard<'_, Option<Arc<CallShared>>> {
        self.inner.call.lock().expect("context mutex poisoned")
    }
}

impl Default for ClientContext {
    fn default() -> Self {
        ClientContext::new()
    }
}

/// Server-side call context: the peer's metadata plus cooperative
/// cancellation of the call being handled.
#[derive(Clone)]
pub struct ServerContext {
    metadata: Arc<Metadata>,
    call: Arc<CallShared>,
}

impl ServerContext {
    pub(crate) fn new(call: Arc<CallShared>, metadata: Metadata) -> Self {
        ServerContext {
            metadata: Arc::new(metadata),
            call,
        }
    }

    #[must_use]
    pub fn peer_metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether the call has been cancelled, by either side.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.call.is_cancelled()
    }

    pub fn try_cancel(&self) {
        self.call.cancel();
    }

    pub(crate) fn call(&self) -> &Arc<CallShared> {
        &self.call
    }
}
