//! Per-call handler contexts, one per call shape.
//!
//! A context is allocated by the listener before the accept operation and
//! handed to the user's handler coroutine with ownership of the call. Every
//! operation is an awaiter returning the ok-bit; a handler typically loops
//! reading until a read returns false, then finishes.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::inproc::{ByteSlot, CallShared, ServerContext, WriteOptions, decode, encode};
use crate::runtime::awaiter::cq_operation;
use crate::status::{Status, StatusCode};

/// Unary call: one request, one finish.
pub struct UnaryContext<Req, Resp> {
    pub request: Req,
    server: ServerContext,
    response: PhantomData<fn(Resp)>,
}

impl<Req, Resp: Serialize> UnaryContext<Req, Resp> {
    pub(crate) fn new(request: Req, server: ServerContext) -> Self {
        UnaryContext {
            request,
            server,
            response: PhantomData,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ServerContext {
        &self.server
    }

    /// Send the response with an OK status.
    pub async fn finish(&mut self, response: &Resp) -> bool {
        self.finish_with_status(response, Status::ok()).await
    }

    pub async fn finish_with_status(&mut self, response: &Resp, status: Status) -> bool {
        write_and_finish(self.server.call(), response, status).await
    }

    /// Finish without a response payload.
    pub async fn finish_with_error(&mut self, status: Status) -> bool {
        finish_plain(self.server.call(), status).await
    }
}

/// Client-streaming call: read requests until false, then one finish.
pub struct ClientStreamContext<Req, Resp> {
    server: ServerContext,
    request: PhantomData<fn() -> Req>,
    response: PhantomData<fn(Resp)>,
}

impl<Req: DeserializeOwned, Resp: Serialize> ClientStreamContext<Req, Resp> {
    pub(crate) fn new(server: ServerContext) -> Self {
        ClientStreamContext {
            server,
            request: PhantomData,
            response: PhantomData,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ServerContext {
        &self.server
    }

    /// Read the next request; false once the client closed the stream.
    pub async fn read(&mut self, request: &mut Req) -> bool {
        read_request(self.server.call(), request).await
    }

    pub async fn finish(&mut self, response: &Resp) -> bool {
        self.finish_with_status(response, Status::ok()).await
    }

    pub async fn finish_with_status(&mut self, response: &Resp, status: Status) -> bool {
        write_and_finish(self.server.call(), response, status).await
    }

    pub async fn finish_with_error(&mut self, status: Status) -> bool {
        finish_plain(self.server.call(), status).await
    }
}

/// Server-streaming call: one request, any number of writes, then finish.
pub struct ServerStreamContext<Req, Resp> {
    pub request: Req,
    server: ServerContext,
    response: PhantomData<fn(Resp)>,
}

impl<Req, Resp: Serialize> ServerStreamContext<Req, Resp> {
    pub(crate) fn new(request: Req, server: ServerContext) -> Self {
        ServerStreamContext {
            request,
            server,
            response: PhantomData,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ServerContext {
        &self.server
    }

    pub async fn write(&mut self, response: &Resp) -> bool {
        write_response(self.server.call(), response).await
    }

    pub async fn write_with_options(&mut self, response: &Resp, options: &WriteOptions) -> bool {
        let _ = options;
        write_response(self.server.call(), response).await
    }

    /// Deliver one last message and the OK status under a single tag.
    pub async fn write_and_finish(&mut self, response: &Resp) -> bool {
        write_and_finish(self.server.call(), response, Status::ok()).await
    }

    pub async fn finish(&mut self) -> bool {
        finish_plain(self.server.call(), Status::ok()).await
    }

    pub async fn finish_with_error(&mut self, status: Status) -> bool {
        finish_plain(self.server.call(), status).await
    }
}

/// Bidirectional call: reads and writes interleave freely.
///
/// Cloneable so a handler can run its read loop and its write loop in
/// separate coroutines over the same call.
pub struct BidiContext<Req, Resp> {
    server: ServerContext,
    request: PhantomData<fn() -> Req>,
    response: PhantomData<fn(Resp)>,
}

impl<Req, Resp> Clone for BidiContext<Req, Resp> {
    fn clone(&self) -> Self {
        BidiContext {
            server: self.server.clone(),
            request: PhantomData,
            response: PhantomData,
        }
    }
}

impl<Req: DeserializeOwned, Resp: Serialize> BidiContext<Req, Resp> {
    pub(crate) fn new(server: ServerContext) -> Self {
        BidiContext {
            server,
            request: PhantomData,
            response: PhantomData,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ServerContext {
        &self.server
    }

    pub async fn read(&self, request: &mut Req) -> bool {
        read_request(self.server.call(), request).await
    }

    pub async fn write(&self, response: &Resp) -> bool {
        write_response(self.server.call(), response).await
    }

    pub async fn write_with_options(&self, response: &Resp, options: &WriteOptions) -> bool {
        let _ = options;
        write_response(self.server.call(), response).await
    }

    pub async fn write_and_finish(&self, response: &Resp) -> bool {
        write_and_finish(self.server.call(), response, Status::ok()).await
    }

    pub async fn finish(&self) -> bool {
        finish_plain(self.server.call(), Status::ok()).await
    }

    pub async fn finish_with_error(&self, status: Status) -> bool {
        finish_plain(self.server.call(), status).await
    }
}

async fn read_request<Req: DeserializeOwned>(call: &Arc<CallShared>, request: &mut Req) -> bool {
    let slot = ByteSlot::default();
    let ok = cq_operation(|queue, tag| call.server_read(Arc::clone(&slot), queue, tag)).await;
    if !ok {
        return false;
    }
    let Some(bytes) = slot.lock().expect("read slot mutex poisoned").take() else {
        return false;
    };
    match decode(&bytes) {
        Ok(message) => {
            *request = message;
            true
        }
        Err(error) => {
            tracing::warn!(%error, "request failed to decode");
            false
        }
    }
}

async fn write_response<Resp: Serialize>(call: &Arc<CallShared>, response: &Resp) -> bool {
    let Ok(bytes) = encode(response) else {
        tracing::warn!("response failed to encode");
        return false;
    };
    cq_operation(|queue, tag| call.server_write(bytes, queue, tag)).await
}

async fn write_and_finish<Resp: Serialize>(
    call: &Arc<CallShared>,
    response: &Resp,
    status: Status,
) -> bool {
    match encode(response) {
        Ok(bytes) => {
            cq_operation(|queue, tag| call.server_finish(Some(bytes), status, queue, tag)).await
        }
        Err(error) => {
            tracing::warn!(%error, "response failed to encode");
            finish_plain(call, Status::new(StatusCode::Internal, "response encoding failed"))
                .await
        }
    }
}

async fn finish_plain(call: &Arc<CallShared>, status: Status) -> bool {
    cq_operation(|queue, tag| call.server_finish(None, status, queue, tag)).await
}
