//! Service registration and the per-method listener coroutines.
//!
//! For each method a service starts listening on, one long-lived listener
//! task runs the accept loop: pick the next executor from the pool, allocate
//! the per-call context, await the accept operation on that executor's
//! notification queue, spawn the user handler onto the same executor, and
//! loop. The loop exits when an accept resolves with ok=false, which is the
//! transport's shutdown signal.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Server;
use super::context::{BidiContext, ClientStreamContext, ServerStreamContext, UnaryContext};
use crate::inproc::{AcceptSeat, AcceptedCall, ServerContext, ServerTransport, decode};
use crate::runtime::awaiter::cq_operation_on;
use crate::runtime::executor::ServerExecutor;
use crate::runtime::task::Task;
use crate::service::{MethodDescriptor, MethodKind};
use crate::status::{Status, StatusCode};

/// A service that can be hosted by a [`Server`].
pub trait ServiceImpl: Send + Sync {
    fn service_name(&self) -> &'static str;

    /// Every method the service serves; registered with the transport
    /// before listening starts.
    fn methods(&self) -> Vec<MethodDescriptor>;

    /// Start one listener per method, using the `start_listening_*` helpers.
    fn start_listening(&self, server: &Server);
}

/// Await the next call for `method` on `executor`'s notification queue.
///
/// Returns `None` when the server is shutting down.
async fn accept_next(
    transport: &Arc<ServerTransport>,
    executor: &ServerExecutor,
    method: MethodDescriptor,
) -> Option<AcceptedCall> {
    let seat = AcceptSeat::default();
    let ok = cq_operation_on(executor.executor(), {
        let transport = Arc::clone(transport);
        let seat = Arc::clone(&seat);
        move |queue, tag| transport.request_call(&method, seat, queue, tag)
    })
    .await;
    if !ok {
        return None;
    }
    seat.lock().expect("accept seat mutex poisoned").take()
}

/// Decode the request payload staged with an accepted call, rejecting the
/// call with INTERNAL when it cannot be decoded.
fn decode_request<Req: DeserializeOwned>(accepted: &AcceptedCall) -> Option<Req> {
    let bytes = accepted.request.as_deref().unwrap_or_default();
    match decode(bytes) {
        Ok(request) => Some(request),
        Err(error) => {
            tracing::warn!(%error, "rejecting call with undecodable request");
            accepted.shared.fail_unserved(Status::new(
                StatusCode::Internal,
                "request decoding failed",
            ));
            None
        }
    }
}

fn server_context(accepted: AcceptedCall) -> ServerContext {
    let AcceptedCall {
        shared, metadata, ..
    } = accepted;
    ServerContext::new(shared, metadata)
}

impl Server {
    pub fn start_listening_unary<Req, Resp, H>(&self, method: &MethodDescriptor, handler: H)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        H: Fn(UnaryContext<Req, Resp>) -> Task<()> + Send + 'static,
    {
        debug_assert_eq!(method.kind, MethodKind::Unary);
        let transport = self.transport();
        let pool = self.pool();
        let method = *method;
        let listener = Task::new(async move {
            loop {
                let executor = pool.pick();
                let Some(accepted) = accept_next(&transport, &executor, method).await else {
                    break;
                };
                let Some(request) = decode_request::<Req>(&accepted) else {
                    continue;
                };
                let context = server_context(accepted);
                executor.spawn(handler(UnaryContext::new(request, context)));
            }
            tracing::debug!(method = %method.path(), "accept loop stopped");
        });
        self.pool().pick().spawn(listener);
    }

    pub fn start_listening_client_stream<Req, Resp, H>(
        &self,
        method: &MethodDescriptor,
        handler: H,
    ) where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        H: Fn(ClientStreamContext<Req, Resp>) -> Task<()> + Send + 'static,
    {
        debug_assert_eq!(method.kind, MethodKind::ClientStream);
        let transport = self.transport();
        let pool = self.pool();
        let method = *method;
        let listener = Task::new(async move {
            loop {
                let executor = pool.pick();
                let Some(accepted) = accept_next(&transport, &executor, method).await else {
                    break;
                };
                let context = server_context(accepted);
                executor.spawn(handler(ClientStreamContext::new(context)));
            }
            tracing::debug!(method = %method.path(), "accept loop stopped");
        });
        self.pool().pick().spawn(listener);
    }

    pub fn start_listening_server_stream<Req, Resp, H>(
        &self,
        method: &MethodDescriptor,
        handler: H,
    ) where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        H: Fn(ServerStreamContext<Req, Resp>) -> Task<()> + Send + 'static,
    {
        debug_assert_eq!(method.kind, MethodKind::ServerStream);
        let transport = self.transport();
        let pool = self.pool();
        let method = *method;
        let listener = Task::new(async move {
            loop {
                let executor = pool.pick();
                let Some(accepted) = accept_next(&transport, &executor, method).await else {
                    break;
                };
                let Some(request) = decode_request::<Req>(&accepted) else {
                    continue;
                };
                let context = server_context(accepted);
                executor.spawn(handler(ServerStreamContext::new(request, context)));
            }
            tracing::debug!(method = %method.path(), "accept loop stopped");
        });
        self.pool().pick().spawn(listener);
    }

    pub fn start_listening_bidirectional_stream<Req, Resp, H>(
        &self,
        method: &MethodDescriptor,
        handler: H,
    ) where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        H: Fn(BidiContext<Req, Resp>) -> Task<()> + Send + 'static,
    {
        debug_assert_eq!(method.kind, MethodKind::BidiStream);
        let transport = self.transport();
        let pool = self.pool();
        let method = *method;
        let listener = Task::new(async move {
            loop {
                let executor = pool.pick();
                let Some(accepted) = accept_next(&transport, &executor, method).await else {
                    break;
                };
                let context = server_context(accepted);
                executor.spawn(handler(BidiContext::new(context)));
            }
            tracing::debug!(method = %method.path(), "accept loop stopped");
        });
        self.pool().pick().spawn(listener);
    }
}
