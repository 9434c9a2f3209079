//! Coroutine runtime for completion-queue-driven RPC
//!
//! corq turns a tag-and-queue RPC interface (operations are initiated with
//! an opaque tag; a background worker pulls tags out of a completion queue
//! in completion order) into straight-line suspending code. A call site
//! awaits an operation; the runtime parks the coroutine under the tag,
//! drives the queue on a pool of worker threads, resumes the right coroutine
//! when its tag re-emerges, and hands back the operation's ok-bit as a plain
//! boolean.
//!
//! The building blocks:
//!
//! - [`Task`]: a suspendable computation. Awaiting a task starts it eagerly
//!   and lifts its result (or its cancellation) into the awaiting coroutine;
//!   [`spawn`] detaches one onto an executor instead.
//! - [`Executor`] / [`ExecutorThreadGroup`]: one completion queue and the
//!   worker threads draining it.
//! - [`cq_operation`]: the generic "initiate with a tag and suspend"
//!   awaiter everything else is built from; [`Alarm`] is the timer flavor.
//! - [`Client`] and [`Server`]: the four RPC call shapes (unary, client
//!   stream, server stream, bidirectional), an auto-retrying unary variant,
//!   and the per-method accept loops that spawn one handler per call.
//! - [`inproc`]: the in-memory transport the whole surface runs against.
//!
//! Cancellation is cooperative and explicit: an operation that cannot
//! produce its effect resumes its coroutine with `false`, and a coroutine
//! that finishes cancelled flips the cancelled bit of its parent before the
//! parent resumes. Nothing is ever torn down mid-frame.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use corq_core::{
//!     Channel, ChannelProvider, Client, ClientContext, ExecutorThreadGroup, MethodDescriptor,
//!     MethodKind, Registry, Server, ServerOptions, ServiceDescriptor, ServiceImpl, Status,
//!     Task, UnaryContext, spawn,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct EchoRequest {
//!     message: String,
//! }
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct EchoResponse {
//!     message: String,
//! }
//!
//! struct EchoService;
//!
//! impl ServiceDescriptor for EchoService {
//!     const NAME: &'static str = "echo.EchoService";
//! }
//!
//! const UNARY_ECHO: MethodDescriptor =
//!     MethodDescriptor::new(EchoService::NAME, "UnaryEcho", MethodKind::Unary);
//!
//! impl ServiceImpl for EchoService {
//!     fn service_name(&self) -> &'static str {
//!         EchoService::NAME
//!     }
//!
//!     fn methods(&self) -> Vec<MethodDescriptor> {
//!         vec![UNARY_ECHO]
//!     }
//!
//!     fn start_listening(&self, server: &Server) {
//!         server.start_listening_unary(
//!             &UNARY_ECHO,
//!             |mut call: UnaryContext<EchoRequest, EchoResponse>| {
//!                 Task::new(async move {
//!                     let response = EchoResponse {
//!                         message: call.request.message.clone(),
//!                     };
//!                     call.finish(&response).await;
//!                 })
//!             },
//!         );
//!     }
//! }
//!
//! let registry = Registry::new();
//! let server = Server::start(
//!     &registry,
//!     ServerOptions {
//!         addresses: vec!["[::1]:4213".to_string()],
//!         services: vec![Arc::new(EchoService)],
//!         ..ServerOptions::default()
//!     },
//! )
//! .expect("server failed to start");
//!
//! let group = ExecutorThreadGroup::default();
//! let client = Client::<EchoService>::new(ChannelProvider::new(Channel::connect(
//!     &registry,
//!     "[::1]:4213",
//! )));
//! spawn(
//!     group.executor(),
//!     Task::new(async move {
//!         let context = ClientContext::new();
//!         let request = EchoRequest {
//!             message: "hello".to_string(),
//!         };
//!         let mut response = EchoResponse::default();
//!         let mut status = Status::default();
//!         if client
//!             .unary(&context, &UNARY_ECHO, &request, &mut response, &mut status)
//!             .await
//!         {
//!             println!("[{status}] {}", response.message);
//!         }
//!     }),
//! );
//! # drop(server);
//! ```

pub mod client;
pub mod cq;
pub mod inproc;
pub mod runtime;
pub mod server;
pub mod service;
pub mod status;

pub use client::retry::{
    ClientContextProvider, DefaultClientContextProvider, DefaultRetryOptions, DefaultRetryPolicy,
    RetryOptions, RetryPolicy,
};
pub use client::{
    BidiCall, ChannelProvider, Client, ClientStreamCall, ServerStreamCall, UnaryCall,
};
pub use cq::{CompletionQueue, CqHandle, Tag};
pub use inproc::{
    Channel, ClientContext, Metadata, Registry, ServerContext, WireError, WriteOptions,
};
pub use runtime::TaskStatus;
pub use runtime::alarm::Alarm;
pub use runtime::awaiter::{CqInitiate, CqOperation, cq_initiate, cq_operation};
pub use runtime::executor::{
    DEFAULT_WORKER_THREADS, Executor, ExecutorThreadGroup, ServerExecutor,
};
pub use runtime::task::{Task, TaskAwait, spawn, start_subroutine};
pub use server::context::{BidiContext, ClientStreamContext, ServerStreamContext, UnaryContext};
pub use server::{DEFAULT_SERVER_EXECUTORS, Server, ServerError, ServerOptions, ServiceImpl};
pub use service::{MethodDescriptor, MethodKind, ServiceDescriptor};
pub use status::{Status, StatusCode};
