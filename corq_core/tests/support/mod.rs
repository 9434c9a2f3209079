//! Shared test support: the echo service and a client/server harness.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use corq_core::{
    Alarm, BidiContext, Channel, ChannelProvider, Client, ClientStreamContext,
    ExecutorThreadGroup, MethodDescriptor, MethodKind, Registry, Server, ServerOptions,
    ServerStreamContext, ServiceDescriptor, ServiceImpl, Task, UnaryContext, spawn,
    start_subroutine,
};

pub const ECHO_ADDRESS: &str = "[::1]:4213";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UnaryEchoRequest {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UnaryEchoResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStreamEchoRequest {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStreamEchoResponse {
    pub messages: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStreamEchoRequest {
    pub message: String,
    pub count: u32,
    pub delay_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStreamEchoResponse {
    pub message: String,
    pub n: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub enum BidiStreamEchoRequest {
    Message { message: String, delay_ms: u64 },
    Start,
    #[default]
    Stop,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BidiStreamEchoResponse {
    pub message: String,
}

pub struct EchoService;

impl ServiceDescriptor for EchoService {
    const NAME: &'static str = "echo.EchoService";
}

pub const UNARY_ECHO: MethodDescriptor =
    MethodDescriptor::new(EchoService::NAME, "UnaryEcho", MethodKind::Unary);
pub const CLIENT_STREAM_ECHO: MethodDescriptor =
    MethodDescriptor::new(EchoService::NAME, "ClientStreamEcho", MethodKind::ClientStream);
pub const SERVER_STREAM_ECHO: MethodDescriptor =
    MethodDescriptor::new(EchoService::NAME, "ServerStreamEcho", MethodKind::ServerStream);
pub const BIDI_STREAM_ECHO: MethodDescriptor = MethodDescriptor::new(
    EchoService::NAME,
    "BidirectionalStreamEcho",
    MethodKind::BidiStream,
);

impl ServiceImpl for EchoService {
    fn service_name(&self) -> &'static str {
        EchoService::NAME
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            UNARY_ECHO,
            CLIENT_STREAM_ECHO,
            SERVER_STREAM_ECHO,
            BIDI_STREAM_ECHO,
        ]
    }

    fn start_listening(&self, server: &Server) {
        server.start_listening_unary(
            &UNARY_ECHO,
            |mut call: UnaryContext<UnaryEchoRequest, UnaryEchoResponse>| {
                Task::new(async move {
                    let response = UnaryEchoResponse {
                        message: call.request.message.clone(),
                    };
                    call.finish(&response).await;
                })
            },
        );

        server.start_listening_client_stream(
            &CLIENT_STREAM_ECHO,
            |mut call: ClientStreamContext<ClientStreamEchoRequest, ClientStreamEchoResponse>| {
                Task::new(async move {
                    let mut response = ClientStreamEchoResponse::default();
                    let mut request = ClientStreamEchoRequest::default();
                    while call.read(&mut request).await {
                        response.messages.push(std::mem::take(&mut request.message));
                    }
                    call.finish(&response).await;
                })
            },
        );

        server.start_listening_server_stream(
            &SERVER_STREAM_ECHO,
            |mut call: ServerStreamContext<ServerStreamEchoRequest, ServerStreamEchoResponse>| {
                Task::new(async move {
                    let message = call.request.message.clone();
                    let count = call.request.count;
                    let delay = Duration::from_millis(call.request.delay_ms);
                    for n in 1..=count {
                        if !Alarm::after(delay).start().await {
                            return;
                        }
                        let response = ServerStreamEchoResponse {
                            message: message.clone(),
                            n,
                        };
                        if !call.write(&response).await {
                            return;
                        }
                    }
                    call.finish().await;
                })
            },
        );

        server.start_listening_bidirectional_stream(
            &BIDI_STREAM_ECHO,
            |call: BidiContext<BidiStreamEchoRequest, BidiStreamEchoResponse>| {
                Task::new(bidi_echo(call))
            },
        );
    }
}

/// Reads commands; `Start` spawns a writer subroutine emitting the
/// configured message on a repeating alarm, `Stop` cancels the alarm and
/// awaits the writer. Finishes OK when the client closes the stream.
async fn bidi_echo(call: BidiContext<BidiStreamEchoRequest, BidiStreamEchoResponse>) {
    let mut message = String::new();
    let mut delay = Duration::from_millis(1000);
    let mut writer: Option<(Arc<Alarm>, Task<()>)> = None;
    let mut request = BidiStreamEchoRequest::default();

    while call.read(&mut request).await {
        match request.clone() {
            BidiStreamEchoRequest::Message {
                message: new_message,
                delay_ms,
            } => {
                message = new_message;
                delay = Duration::from_millis(delay_ms);
            }
            BidiStreamEchoRequest::Start => {
                if writer.is_none() {
                    let alarm = Arc::new(Alarm::after(delay));
                    let ticker = {
                        let call = call.clone();
                        let alarm = Arc::clone(&alarm);
                        let message = message.clone();
                        Task::new(async move {
                            loop {
                                alarm.set_deadline(Instant::now() + delay);
                                if !alarm.start().await {
                                    break;
                                }
                                let response = BidiStreamEchoResponse {
                                    message: message.clone(),
                                };
                                if !call.write(&response).await {
                                    break;
                                }
                            }
                        })
                    };
                    writer = Some((alarm, start_subroutine(ticker)));
                }
            }
            BidiStreamEchoRequest::Stop => {
                if let Some((alarm, ticker)) = writer.take() {
                    alarm.cancel();
                    let _ = ticker.await;
                }
            }
        }
    }

    if let Some((alarm, ticker)) = writer.take() {
        alarm.cancel();
        let _ = ticker.await;
    }
    call.finish().await;
}

/// A registry, a running echo server, a client thread group, and a client.
pub struct EchoHarness {
    pub registry: Arc<Registry>,
    pub server: Server,
    pub group: ExecutorThreadGroup,
    pub client: Arc<Client<EchoService>>,
}

/// Route runtime tracing to the test output, honoring `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn echo_harness() -> EchoHarness {
    init_tracing();
    let registry = Registry::new();
    let server = Server::start(
        &registry,
        ServerOptions {
            addresses: vec![ECHO_ADDRESS.to_string()],
            services: vec![Arc::new(EchoService)],
            ..ServerOptions::default()
        },
    )
    .expect("echo server failed to start");
    let group = ExecutorThreadGroup::default();
    let client = Arc::new(Client::new(ChannelProvider::new(Channel::connect(
        &registry,
        ECHO_ADDRESS,
    ))));
    EchoHarness {
        registry,
        server,
        group,
        client,
    }
}

/// Run a client coroutine on the harness's executor and wait for its value.
pub fn run_client<T: Send + 'static>(
    harness: &EchoHarness,
    body: impl Future<Output = T> + Send + 'static,
) -> T {
    run_on(&harness.group, body)
}

/// Run a coroutine on `group` and wait for its value on this thread.
pub fn run_on<T: Send + 'static>(
    group: &ExecutorThreadGroup,
    body: impl Future<Output = T> + Send + 'static,
) -> T {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    spawn(
        group.executor(),
        Task::new(async move {
            let _ = sender.send(body.await);
        }),
    );
    receiver
        .recv_timeout(Duration::from_secs(30))
        .expect("client task did not finish in time")
}
