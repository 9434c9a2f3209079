//! In-memory RPC substrate: the concrete implementation of the surface the
//! runtime consumes from an RPC library.
//!
//! This is the loopback stand-in for a real RPC core: channels resolve to
//! servers through a shared [`Registry`], every message crosses a call as a
//! bincode payload, and all operation completions are delivered through the
//! completion queues the executors drain. It implements the full contract
//! the call wrappers and the server accept loops are written against
//! (accept matchmaking, end-of-stream reads, terminal statuses, cooperative
//! cancellation, and shutdown draining) without any wire transport
//! underneath.

mod call;
mod channel;
mod context;
mod server;
mod wire;

pub use channel::{Channel, Registry};
pub use context::{ClientContext, Metadata, ServerContext};
pub use wire::WireError;

/// Advisory per-write options. The in-proc transport delivers every write
/// immediately, so the buffer hint has no observable effect here.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    pub buffer_hint: bool,
}

pub(crate) use call::{ByteSlot, CallShared, StatusSlot};
pub(crate) use server::{AcceptSeat, AcceptedCall, ServerTransport};
pub(crate) use wire::{decode, encode};
