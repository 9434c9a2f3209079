//! Automatic retry for unary calls.
//!
//! A retry policy maps a non-OK status to an optional deadline for the next
//! attempt; a context provider produces the fresh per-attempt client
//! context. The default policy retries UNAVAILABLE up to five times with a
//! growing backoff and treats every other status as terminal.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Client;
use crate::inproc::ClientContext;
use crate::runtime::alarm::Alarm;
use crate::service::{MethodDescriptor, ServiceDescriptor};
use crate::status::{Status, StatusCode};

/// Decides whether (and when) a failed attempt should be retried.
pub trait RetryPolicy {
    /// A deadline to wait for before the next attempt, or `None` to give up.
    fn should_retry(&mut self, status: &Status) -> Option<Instant>;
}

/// Retry UNAVAILABLE up to five times, backing off 1, 2, 3, 5 and 8 seconds.
#[derive(Default)]
pub struct DefaultRetryPolicy {
    attempts: usize,
}

const RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(8),
];

impl DefaultRetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        DefaultRetryPolicy::default()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&mut self, status: &Status) -> Option<Instant> {
        if status.code() != StatusCode::Unavailable {
            return None;
        }
        let delay = RETRY_DELAYS.get(self.attempts)?;
        self.attempts += 1;
        Some(Instant::now() + *delay)
    }
}

/// Produces the client context for each attempt.
pub trait ClientContextProvider {
    fn context(&mut self) -> ClientContext;
}

#[derive(Default)]
pub struct DefaultClientContextProvider;

impl ClientContextProvider for DefaultClientContextProvider {
    fn context(&mut self) -> ClientContext {
        ClientContext::new()
    }
}

/// Bundle of retry policy and context provider for one retried call.
pub struct RetryOptions<P, C> {
    pub retry_policy: P,
    pub context_provider: C,
}

impl<P, C> RetryOptions<P, C> {
    pub fn new(retry_policy: P, context_provider: C) -> Self {
        RetryOptions {
            retry_policy,
            context_provider,
        }
    }
}

pub type DefaultRetryOptions = RetryOptions<DefaultRetryPolicy, DefaultClientContextProvider>;

impl Default for DefaultRetryOptions {
    fn default() -> Self {
        RetryOptions::new(DefaultRetryPolicy::new(), DefaultClientContextProvider)
    }
}

impl<S: ServiceDescriptor> Client<S> {
    /// Perform a unary call, retrying according to `options`.
    ///
    /// Terminates on a false framing bit (returns false, the status buffer
    /// is not meaningful), on an OK status, or when the policy declines a
    /// further attempt; the last two return true with the final status in
    /// the buffer.
    pub async fn auto_retry_unary<Req, Resp, P, C>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        response: &mut Resp,
        status: &mut Status,
        mut options: RetryOptions<P, C>,
    ) -> bool
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        P: RetryPolicy,
        C: ClientContextProvider,
    {
        loop {
            let context = options.context_provider.context();
            if !self.unary(&context, method, request, response, status).await {
                return false;
            }
            if status.is_ok() {
                return true;
            }
            let Some(deadline) = options.retry_policy.should_retry(status) else {
                return true;
            };
            tracing::debug!(code = status.code().name(), "retrying unary call");
            // The alarm result is deliberately not checked: a cancelled
            // backoff simply starts the next attempt early, and a draining
            // queue fails that attempt's own operations.
            let _ = Alarm::new(deadline).start().await;
        }
    }
}
