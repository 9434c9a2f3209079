//! Client-side call orchestration: the typed facade over channels, the
//! per-shape call wrappers, and round-robin channel selection.
//!
//! Every operation a wrapper exposes is an awaiter resolving to the ok-bit;
//! the application-layer result arrives separately through the status buffer
//! passed into the finish operation. Call wrappers own their underlying
//! call for the duration of the RPC and must outlive any operation issued
//! through them.

pub mod retry;

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::inproc::{
    ByteSlot, CallShared, Channel, ClientContext, StatusSlot, WriteOptions, decode, encode,
};
use crate::runtime::awaiter::{cq_initiate, cq_operation};
use crate::service::{MethodDescriptor, MethodKind, ServiceDescriptor};
use crate::status::{Status, StatusCode};

/// An ordered set of channels with atomic round-robin selection.
pub struct ChannelProvider {
    channels: Vec<Channel>,
    next: AtomicUsize,
}

impl ChannelProvider {
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        ChannelProvider {
            channels: vec![channel],
            next: AtomicUsize::new(0),
        }
    }

    /// # Panics
    /// Panics when `channels` is empty.
    #[must_use]
    pub fn from_channels(channels: Vec<Channel>) -> Self {
        assert!(
            !channels.is_empty(),
            "channel provider needs at least one channel"
        );
        ChannelProvider {
            channels,
            next: AtomicUsize::new(0),
        }
    }

    pub fn select_next(&self) -> &Channel {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.channels.len();
        &self.channels[index]
    }
}

/// Typed client for one service definition.
pub struct Client<S> {
    channels: ChannelProvider,
    service: PhantomData<fn() -> S>,
}

impl<S: ServiceDescriptor> Client<S> {
    #[must_use]
    pub fn new(channels: ChannelProvider) -> Self {
        Client {
            channels,
            service: PhantomData,
        }
    }

    fn check_method(method: &MethodDescriptor, kind: MethodKind) {
        debug_assert_eq!(method.service, S::NAME, "method belongs to another service");
        debug_assert_eq!(method.kind, kind, "method has a different call shape");
    }

    /// Start a unary call. The initiator itself does not suspend; the
    /// response and status arrive through [`UnaryCall::finish`].
    pub fn call_unary<Req, Resp>(
        &self,
        context: &ClientContext,
        method: &MethodDescriptor,
        request: &Req,
    ) -> UnaryCall<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        Self::check_method(method, MethodKind::Unary);
        let channel = self.channels.select_next();
        let shared = match encode(request) {
            Ok(bytes) => channel.start_call(method, context, Some(bytes), true),
            Err(error) => {
                tracing::warn!(%error, "unary request failed to encode");
                channel.failed_call(
                    context,
                    Status::new(StatusCode::Internal, "request encoding failed"),
                )
            }
        };
        UnaryCall {
            shared,
            response: PhantomData,
        }
    }

    /// Perform a whole unary call: start it and await its finish.
    pub async fn unary<Req, Resp>(
        &self,
        context: &ClientContext,
        method: &MethodDescriptor,
        request: &Req,
        response: &mut Resp,
        status: &mut Status,
    ) -> bool
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut call = self.call_unary(context, method, request);
        call.finish(response, status).await
    }

    /// Start a client-streaming call. Resolves to `None` when the call
    /// could not be established at the framing layer.
    pub async fn call_client_stream<Req, Resp>(
        &self,
        context: &ClientContext,
        method: &MethodDescriptor,
    ) -> Option<ClientStreamCall<Req, Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        Self::check_method(method, MethodKind::ClientStream);
        let channel = self.channels.select_next().clone();
        let method = *method;
        cq_initiate(move |queue, tag| {
            let shared = channel.start_call(&method, context, None, false);
            queue.post(tag, true);
            ClientStreamCall {
                shared,
                request: PhantomData,
                response: PhantomData,
            }
        })
        .await
    }

    /// Start a server-streaming call carrying `request`.
    pub async fn call_server_stream<Req, Resp>(
        &self,
        context: &ClientContext,
        method: &MethodDescriptor,
        request: &Req,
    ) -> Option<ServerStreamCall<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        Self::check_method(method, MethodKind::ServerStream);
        let initial = match encode(request) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(%error, "server-stream request failed to encode");
                return None;
            }
        };
        let channel = self.channels.select_next().clone();
        let method = *method;
        cq_initiate(move |queue, tag| {
            let shared = channel.start_call(&method, context, Some(initial), true);
            queue.post(tag, true);
            ServerStreamCall {
                shared,
                response: PhantomData,
            }
        })
        .await
    }

    /// Start a bidirectional-streaming call.
    pub async fn call_bidirectional_stream<Req, Resp>(
        &self,
        context: &ClientContext,
        method: &MethodDescriptor,
    ) -> Option<BidiCall<Req, Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        Self::check_method(method, MethodKind::BidiStream);
        let channel = self.channels.select_next().clone();
        let method = *method;
        cq_initiate(move |queue, tag| {
            let shared = channel.start_call(&method, context, None, false);
            queue.post(tag, true);
            BidiCall {
                shared,
                request: PhantomData,
                response: PhantomData,
            }
        })
        .await
    }
}

/// A started unary call; finish delivers the response and status.
#[must_use]
pub struct UnaryCall<Resp> {
    shared: Arc<CallShared>,
    response: PhantomData<fn() -> Resp>,
}

impl<Resp: DeserializeOwned> UnaryCall<Resp> {
    /// Await the server's response and status. Returns the framing bit;
    /// `response` is only written when the status is OK.
    pub async fn finish(&mut self, response: &mut Resp, status: &mut Status) -> bool {
        let response_slot = ByteSlot::default();
        let status_slot = StatusSlot::default();
        let ok = cq_operation(|queue, tag| {
            self.shared.client_finish(
                Some(Arc::clone(&response_slot)),
                Arc::clone(&status_slot),
                queue,
                tag,
            );
        })
        .await;
        if !ok {
            return false;
        }
        finish_buffers(&response_slot, &status_slot, response, status);
        true
    }
}

impl<Resp> Drop for UnaryCall<Resp> {
    fn drop(&mut self) {
        debug_assert!(
            !self.shared.has_parked_client_ops(),
            "unary call dropped with an outstanding operation"
        );
    }
}

/// A started client-streaming call.
#[must_use]
pub struct ClientStreamCall<Req, Resp> {
    shared: Arc<CallShared>,
    request: PhantomData<fn(Req)>,
    response: PhantomData<fn() -> Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> ClientStreamCall<Req, Resp> {
    pub async fn write(&mut self, message: &Req) -> bool {
        write_message(&self.shared, message).await
    }

    pub async fn write_with_options(&mut self, message: &Req, options: &WriteOptions) -> bool {
        let _ = options;
        write_message(&self.shared, message).await
    }

    /// Close the write side of the stream.
    pub async fn writes_done(&mut self) -> bool {
        cq_operation(|queue, tag| self.shared.client_writes_done(queue, tag)).await
    }

    /// Await the server's single response and status.
    pub async fn finish(&mut self, response: &mut Resp, status: &mut Status) -> bool {
        let response_slot = ByteSlot::default();
        let status_slot = StatusSlot::default();
        let ok = cq_operation(|queue, tag| {
            self.shared.client_finish(
                Some(Arc::clone(&response_slot)),
                Arc::clone(&status_slot),
                queue,
                tag,
            );
        })
        .await;
        if !ok {
            return false;
        }
        finish_buffers(&response_slot, &status_slot, response, status);
        true
    }
}

impl<Req, Resp> Drop for ClientStreamCall<Req, Resp> {
    fn drop(&mut self) {
        debug_assert!(
            !self.shared.has_parked_client_ops(),
            "client-stream call dropped with an outstanding operation"
        );
    }
}

/// A started server-streaming call.
#[must_use]
pub struct ServerStreamCall<Resp> {
    shared: Arc<CallShared>,
    response: PhantomData<fn() -> Resp>,
}

impl<Resp: DeserializeOwned> ServerStreamCall<Resp> {
    /// Read the next message; false at end-of-stream or cancellation.
    pub async fn read(&mut self, response: &mut Resp) -> bool {
        read_message(&self.shared, response).await
    }

    /// Await the terminal status once reads have drained.
    pub async fn finish(&mut self, status: &mut Status) -> bool {
        finish_stream(&self.shared, status).await
    }
}

impl<Resp> Drop for ServerStreamCall<Resp> {
    fn drop(&mut self) {
        debug_assert!(
            !self.shared.has_parked_client_ops(),
            "server-stream call dropped with an outstanding operation"
        );
    }
}

/// A started bidirectional-streaming call.
///
/// Cloneable so a read loop can run in a subroutine while the originating
/// coroutine keeps writing; one outstanding operation per direction.
#[must_use]
pub struct BidiCall<Req, Resp> {
    shared: Arc<CallShared>,
    request: PhantomData<fn(Req)>,
    response: PhantomData<fn() -> Resp>,
}

impl<Req, Resp> Clone for BidiCall<Req, Resp> {
    fn clone(&self) -> Self {
        BidiCall {
            shared: Arc::clone(&self.shared),
            request: PhantomData,
            response: PhantomData,
        }
    }
}

impl<Req: Serialize, Resp: DeserializeOwned> BidiCall<Req, Resp> {
    pub async fn read(&self, response: &mut Resp) -> bool {
        read_message(&self.shared, response).await
    }

    pub async fn write(&self, message: &Req) -> bool {
        write_message(&self.shared, message).await
    }

    pub async fn write_with_options(&self, message: &Req, options: &WriteOptions) -> bool {
        let _ = options;
        write_message(&self.shared, message).await
    }

    pub async fn writes_done(&self) -> bool {
        cq_operation(|queue, tag| self.shared.client_writes_done(queue, tag)).await
    }

    pub async fn finish(&self, status: &mut Status) -> bool {
        finish_stream(&self.shared, status).await
    }
}

async fn write_message<Req: Serialize>(shared: &Arc<CallShared>, message: &Req) -> bool {
    let Ok(bytes) = encode(message) else {
        tracing::warn!("stream message failed to encode");
        return false;
    };
    cq_operation(|queue, tag| shared.client_write(bytes, queue, tag)).await
}

async fn read_message<Resp: DeserializeOwned>(
    shared: &Arc<CallShared>,
    response: &mut Resp,
) -> bool {
    let slot = ByteSlot::default();
    let ok = cq_operation(|queue, tag| shared.client_read(Arc::clone(&slot), queue, tag)).await;
    if !ok {
        return false;
    }
    let Some(bytes) = slot.lock().expect("read slot mutex poisoned").take() else {
        return false;
    };
    match decode(&bytes) {
        Ok(message) => {
            *response = message;
            true
        }
        Err(error) => {
            tracing::warn!(%error, "stream message failed to decode");
            false
        }
    }
}

async fn finish_stream(shared: &Arc<CallShared>, status: &mut Status) -> bool {
    let status_slot = StatusSlot::default();
    let ok = cq_operation(|queue, tag| {
        shared.client_finish(None, Arc::clone(&status_slot), queue, tag);
    })
    .await;
    if !ok {
        return false;
    }
    if let Some(terminal) = status_slot.lock().expect("status slot mutex poisoned").take() {
        *status = terminal;
    }
    true
}

fn finish_buffers<Resp: DeserializeOwned>(
    response_slot: &ByteSlot,
    status_slot: &StatusSlot,
    response: &mut Resp,
    status: &mut Status,
) {
    if let Some(terminal) = status_slot.lock().expect("status slot mutex poisoned").take() {
        *status = terminal;
    }
    if status.is_ok() {
        if let Some(bytes) = response_slot
            .lock()
            .expect("response slot mutex poisoned")
            .take()
        {
            match decode(&bytes) {
                Ok(message) => *response = message,
                Err(error) => {
                    tracing::warn!(%error, "response failed to decode");
                    *status = Status::new(StatusCode::Internal, "response decoding failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inproc::Registry;

    fn test_channels(count: usize) -> Vec<Channel> {
        let registry = Registry::new();
        (0..count)
            .map(|index| Channel::connect(&registry, format!("[::1]:{}", 4000 + index)))
            .collect()
    }

    #[test]
    fn round_robin_selection_is_balanced() {
        let provider = ChannelProvider::from_channels(test_channels(3));
        let mut counts = std::collections::HashMap::new();
        for _ in 0..10 {
            *counts
                .entry(provider.select_next().target().to_string())
                .or_insert(0usize) += 1;
        }
        // 10 selections over 3 channels: each chosen 3 or 4 times.
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count == 3 || *count == 4, "unbalanced selection: {count}");
        }
    }

    #[test]
    #[should_panic(expected = "at least one channel")]
    fn provider_rejects_empty_channel_list() {
        let _ = ChannelProvider::from_channels(Vec::new());
    }
}
