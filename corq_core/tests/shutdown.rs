//! Server shutdown: draining, the forced-cancel deadline, and the fate of
//! calls issued afterwards.

mod support;

use std::time::{Duration, Instant};

use corq_core::{ClientContext, Status, Task, spawn};

use support::{
    SERVER_STREAM_ECHO, ServerStreamEchoRequest, ServerStreamEchoResponse, UNARY_ECHO,
    UnaryEchoRequest, UnaryEchoResponse,
};

#[test]
fn shutdown_deadline_cancels_a_stream_in_flight() {
    let harness = support::echo_harness();
    let client = harness.client.clone();
    let (progress_sender, progress_receiver) = crossbeam_channel::bounded(1);
    let (done_sender, done_receiver) = crossbeam_channel::bounded(1);

    spawn(
        harness.group.executor(),
        Task::new(async move {
            let context = ClientContext::new();
            // Roughly five seconds of stream if left alone.
            let request = ServerStreamEchoRequest {
                message: "drain".to_string(),
                count: 100,
                delay_ms: 50,
            };
            let Some(mut call) = client
                .call_server_stream::<ServerStreamEchoRequest, ServerStreamEchoResponse>(
                    &context,
                    &SERVER_STREAM_ECHO,
                    &request,
                )
                .await
            else {
                let _ = done_sender.send((0u32, true));
                return;
            };
            let mut reads = 0u32;
            let mut response = ServerStreamEchoResponse::default();
            while call.read(&mut response).await {
                reads += 1;
                if reads == 1 {
                    let _ = progress_sender.send(());
                }
            }
            let mut status = Status::default();
            let ok = call.finish(&mut status).await;
            let _ = done_sender.send((reads, ok));
        }),
    );

    progress_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("stream never produced a first message");

    let begun = Instant::now();
    harness
        .server
        .shutdown_with_deadline(Instant::now() + Duration::from_millis(500));
    let took = begun.elapsed();

    // The deadline forces cancellation of the in-flight handler; shutdown
    // (including joining every server worker) must not run long past it.
    assert!(took < Duration::from_secs(2), "shutdown took {took:?}");

    let (reads, ok) = done_receiver
        .recv_timeout(Duration::from_secs(2))
        .expect("client operations were not drained");
    assert!(reads >= 1);
    assert!(!ok, "operations on a cancelled call must report false");
}

#[test]
fn idle_server_shutdown_is_prompt_and_idempotent() {
    let harness = support::echo_harness();
    let begun = Instant::now();
    harness.server.shutdown();
    harness.server.shutdown();
    assert!(begun.elapsed() < Duration::from_secs(1));
}

#[test]
fn calls_after_shutdown_fail_with_unavailable() {
    let harness = support::echo_harness();
    harness.server.shutdown();

    let client = harness.client.clone();
    let (ok, status) = support::run_client(&harness, async move {
        let context = ClientContext::new();
        let request = UnaryEchoRequest {
            message: "late".to_string(),
        };
        let mut response = UnaryEchoResponse::default();
        let mut status = Status::default();
        let ok = client
            .unary(&context, &UNARY_ECHO, &request, &mut response, &mut status)
            .await;
        (ok, status)
    });

    assert!(ok);
    assert_eq!(status.code(), corq_core::StatusCode::Unavailable);
}
