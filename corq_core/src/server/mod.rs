//! The server: a pool of server executors, their worker threads, and the
//! listener coroutines accepting calls for each registered method.

pub mod context;
mod service;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;

use crate::inproc::{Registry, ServerTransport};
use crate::runtime::executor::{
    DEFAULT_WORKER_THREADS, ExecutorThreadGroup, ServerExecutor,
};

pub use service::ServiceImpl;

/// Default number of server executors (each with its own queue and workers).
pub const DEFAULT_SERVER_EXECUTORS: usize = 2;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("address already bound: {0}")]
    AddressInUse(String),
    #[error("server has no addresses to bind")]
    NoAddresses,
    #[error("duplicate method registration: {0}")]
    DuplicateMethod(String),
}

pub struct ServerOptions {
    pub addresses: Vec<String>,
    pub services: Vec<Arc<dyn ServiceImpl>>,
    pub executor_count: usize,
    pub threads_per_executor: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            addresses: Vec::new(),
            services: Vec::new(),
            executor_count: DEFAULT_SERVER_EXECUTORS,
            threads_per_executor: DEFAULT_WORKER_THREADS,
        }
    }
}

/// Round-robin picker over the server's executors.
pub(crate) struct ExecutorPool {
    executors: Vec<ServerExecutor>,
    next: AtomicUsize,
}

impl ExecutorPool {
    pub(crate) fn pick(&self) -> ServerExecutor {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.executors.len();
        self.executors[index].clone()
    }
}

/// A running server hosting one or more services.
pub struct Server {
    registry: Arc<Registry>,
    addresses: Vec<String>,
    transport: Arc<ServerTransport>,
    pool: Arc<ExecutorPool>,
    groups: Mutex<Vec<ExecutorThreadGroup>>,
    shut: AtomicBool,
}

impl Server {
    /// Bind the addresses, start the executor pool, and begin listening for
    /// every method of every service.
    pub fn start(registry: &Arc<Registry>, options: ServerOptions) -> Result<Server, ServerError> {
        if options.addresses.is_empty() {
            return Err(ServerError::NoAddresses);
        }

        let transport = ServerTransport::new();
        for service in &options.services {
            for method in service.methods() {
                transport.add_method(&method)?;
            }
        }

        let executors: Vec<ServerExecutor> = (0..options.executor_count.max(1))
            .map(|_| ServerExecutor::new())
            .collect();
        let groups = executors
            .iter()
            .map(|server_executor| {
                ExecutorThreadGroup::with_executor(
                    server_executor.executor().clone(),
                    options.threads_per_executor.max(1),
                )
            })
            .collect();

        let mut bound: Vec<String> = Vec::new();
        for address in &options.addresses {
            if let Err(error) = registry.bind(address, &transport) {
                for address in &bound {
                    registry.unbind(address);
                }
                return Err(error);
            }
            bound.push(address.clone());
        }

        let server = Server {
            registry: Arc::clone(registry),
            addresses: bound,
            transport,
            pool: Arc::new(ExecutorPool {
                executors,
                next: AtomicUsize::new(0),
            }),
            groups: Mutex::new(groups),
            shut: AtomicBool::new(false),
        };
        tracing::info!(addresses = ?server.addresses, "server started");

        for service in &options.services {
            service.start_listening(&server);
        }
        Ok(server)
    }

    /// Stop accepting new calls and wait for in-flight calls to drain, then
    /// drain the executors and join their workers. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_inner(None);
    }

    /// Like [`Server::shutdown`], but in-flight calls still running at
    /// `deadline` are forcibly cancelled.
    pub fn shutdown_with_deadline(&self, deadline: Instant) {
        self.shutdown_inner(Some(deadline));
    }

    fn shutdown_inner(&self, deadline: Option<Instant>) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("server shutting down");
        for address in &self.addresses {
            self.registry.unbind(address);
        }
        self.transport.shutdown(deadline);
        let mut groups = std::mem::take(
            &mut *self.groups.lock().expect("server group mutex poisoned"),
        );
        for group in &mut groups {
            group.shutdown();
        }
        tracing::info!("server stopped");
    }

    pub(crate) fn transport(&self) -> Arc<ServerTransport> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn pool(&self) -> Arc<ExecutorPool> {
        Arc::clone(&self.pool)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
