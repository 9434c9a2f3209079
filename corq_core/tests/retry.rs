//! Auto-retry behavior against a server that fails with UNAVAILABLE a
//! configurable number of times before succeeding.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use corq_core::{
    Channel, ChannelProvider, Client, ClientContext, DefaultClientContextProvider,
    DefaultRetryOptions, ExecutorThreadGroup, MethodDescriptor, MethodKind, Registry,
    RetryOptions, RetryPolicy, Server, ServerOptions, ServiceDescriptor, ServiceImpl, Status,
    StatusCode, Task, UnaryContext,
};

use support::{UnaryEchoRequest, UnaryEchoResponse};

struct FlakyService {
    failures_before_success: usize,
    attempts: Arc<AtomicUsize>,
}

impl ServiceDescriptor for FlakyService {
    const NAME: &'static str = "test.FlakyEcho";
}

const FLAKY_ECHO: MethodDescriptor =
    MethodDescriptor::new(FlakyService::NAME, "UnaryEcho", MethodKind::Unary);

impl ServiceImpl for FlakyService {
    fn service_name(&self) -> &'static str {
        FlakyService::NAME
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![FLAKY_ECHO]
    }

    fn start_listening(&self, server: &Server) {
        let failures = self.failures_before_success;
        let attempts = Arc::clone(&self.attempts);
        server.start_listening_unary(
            &FLAKY_ECHO,
            move |mut call: UnaryContext<UnaryEchoRequest, UnaryEchoResponse>| {
                let attempts = Arc::clone(&attempts);
                Task::new(async move {
                    let attempt = attempts.fetch_add(1, Ordering::Relaxed);
                    if attempt < failures {
                        call.finish_with_error(Status::new(
                            StatusCode::Unavailable,
                            "try again later",
                        ))
                        .await;
                    } else {
                        let response = UnaryEchoResponse {
                            message: call.request.message.clone(),
                        };
                        call.finish(&response).await;
                    }
                })
            },
        );
    }
}

struct FlakyHarness {
    #[allow(dead_code)]
    server: Server,
    group: ExecutorThreadGroup,
    client: Arc<Client<FlakyService>>,
    attempts: Arc<AtomicUsize>,
}

fn flaky_harness(failures_before_success: usize) -> FlakyHarness {
    const ADDRESS: &str = "[::1]:4214";
    support::init_tracing();
    let registry = Registry::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let server = Server::start(
        &registry,
        ServerOptions {
            addresses: vec![ADDRESS.to_string()],
            services: vec![Arc::new(FlakyService {
                failures_before_success,
                attempts: Arc::clone(&attempts),
            })],
            ..ServerOptions::default()
        },
    )
    .expect("flaky server failed to start");
    let group = ExecutorThreadGroup::default();
    let client = Arc::new(Client::new(ChannelProvider::new(Channel::connect(
        &registry, ADDRESS,
    ))));
    FlakyHarness {
        server,
        group,
        client,
        attempts,
    }
}

/// Same shape as the default policy, with delays short enough for a test.
struct ShortBackoff {
    attempts: usize,
    max_retries: usize,
}

impl RetryPolicy for ShortBackoff {
    fn should_retry(&mut self, status: &Status) -> Option<Instant> {
        if status.code() != StatusCode::Unavailable || self.attempts >= self.max_retries {
            return None;
        }
        self.attempts += 1;
        Some(Instant::now() + Duration::from_millis(20))
    }
}

/// Declines every retry.
struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn should_retry(&mut self, _status: &Status) -> Option<Instant> {
        None
    }
}

#[test]
fn default_policy_retries_unavailable_until_success() {
    let harness = flaky_harness(2);
    let client = Arc::clone(&harness.client);
    let started = Instant::now();

    let (ok, status, response) = support::run_on(&harness.group, async move {
        let request = UnaryEchoRequest {
            message: "persistent".to_string(),
        };
        let mut response = UnaryEchoResponse::default();
        let mut status = Status::default();
        let ok = client
            .auto_retry_unary(
                &FLAKY_ECHO,
                &request,
                &mut response,
                &mut status,
                DefaultRetryOptions::default(),
            )
            .await;
        (ok, status, response)
    });
    let elapsed = started.elapsed();

    assert!(ok);
    assert!(status.is_ok(), "unexpected status {status}");
    assert_eq!(response.message, "persistent");
    assert_eq!(harness.attempts.load(Ordering::Relaxed), 3);
    // Two backoffs with the default schedule: 1s then 2s.
    assert!(elapsed >= Duration::from_secs(3), "retried too fast: {elapsed:?}");
}

#[test]
fn policy_declining_retry_means_exactly_one_attempt() {
    let harness = flaky_harness(usize::MAX);
    let client = Arc::clone(&harness.client);

    let (ok, status) = support::run_on(&harness.group, async move {
        let request = UnaryEchoRequest {
            message: "once".to_string(),
        };
        let mut response = UnaryEchoResponse::default();
        let mut status = Status::default();
        let ok = client
            .auto_retry_unary(
                &FLAKY_ECHO,
                &request,
                &mut response,
                &mut status,
                RetryOptions::new(NeverRetry, DefaultClientContextProvider),
            )
            .await;
        (ok, status)
    });

    assert!(ok);
    assert_eq!(status.code(), StatusCode::Unavailable);
    assert_eq!(harness.attempts.load(Ordering::Relaxed), 1);
}

#[test]
fn exhausted_policy_gives_up_after_initial_plus_five_retries() {
    let harness = flaky_harness(usize::MAX);
    let client = Arc::clone(&harness.client);

    let (ok, status) = support::run_on(&harness.group, async move {
        let request = UnaryEchoRequest {
            message: "doomed".to_string(),
        };
        let mut response = UnaryEchoResponse::default();
        let mut status = Status::default();
        let ok = client
            .auto_retry_unary(
                &FLAKY_ECHO,
                &request,
                &mut response,
                &mut status,
                RetryOptions::new(
                    ShortBackoff {
                        attempts: 0,
                        max_retries: 5,
                    },
                    DefaultClientContextProvider,
                ),
            )
            .await;
        (ok, status)
    });

    assert!(ok, "exhausted retries still return the last status");
    assert_eq!(status.code(), StatusCode::Unavailable);
    assert_eq!(harness.attempts.load(Ordering::Relaxed), 6);
}

#[test]
fn call_to_unbound_address_reports_unavailable() {
    let registry = Registry::new();
    let group = ExecutorThreadGroup::default();
    let client: Arc<Client<FlakyService>> = Arc::new(Client::new(ChannelProvider::new(
        Channel::connect(&registry, "[::1]:59999"),
    )));

    let (ok, status) = support::run_on(&group, async move {
        let context = ClientContext::new();
        let request = UnaryEchoRequest {
            message: "anyone there?".to_string(),
        };
        let mut response = UnaryEchoResponse::default();
        let mut status = Status::default();
        let ok = client
            .unary(&context, &FLAKY_ECHO, &request, &mut response, &mut status)
            .await;
        (ok, status)
    });

    assert!(ok, "the finish itself succeeds at the framing layer");
    assert_eq!(status.code(), StatusCode::Unavailable);
}
