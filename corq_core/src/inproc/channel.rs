//! Client connections and the address book pairing them with servers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::inproc::call::CallShared;
use crate::inproc::context::ClientContext;
use crate::inproc::server::ServerTransport;
use crate::server::ServerError;
use crate::service::MethodDescriptor;
use crate::status::{Status, StatusCode};

/// Address book mapping listen addresses to bound servers.
///
/// Every channel and server in one process shares a registry; separate
/// registries are fully isolated (useful in tests).
pub struct Registry {
    servers: Mutex<HashMap<String, Arc<ServerTransport>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            servers: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn bind(
        &self,
        address: &str,
        transport: &Arc<ServerTransport>,
    ) -> Result<(), ServerError> {
        let mut servers = self.lock_servers();
        if servers.contains_key(address) {
            return Err(ServerError::AddressInUse(address.to_string()));
        }
        servers.insert(address.to_string(), Arc::clone(transport));
        Ok(())
    }

    pub(crate) fn unbind(&self, address: &str) {
        self.lock_servers().remove(address);
    }

    fn lookup(&self, address: &str) -> Option<Arc<ServerTransport>> {
        self.lock_servers().get(address).cloned()
    }

    fn lock_servers(&self) -> MutexGuard<'_, HashMap<String, Arc<ServerTransport>>> {
        self.servers.lock().expect("registry mutex poisoned")
    }
}

/// A client connection to one listen address.
///
/// Resolution is lazy and per-call: a call made while no server is bound to
/// the target completes with an UNAVAILABLE status, which is what the
/// default retry policy keys on.
#[derive(Clone)]
pub struct Channel {
    registry: Arc<Registry>,
    target: String,
}

impl Channel {
    pub fn connect(registry: &Arc<Registry>, target: impl Into<String>) -> Channel {
        Channel {
            registry: Arc::clone(registry),
            target: target.into(),
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Create a call and offer it to the bound server, if any.
    pub(crate) fn start_call(
        &self,
        method: &MethodDescriptor,
        context: &ClientContext,
        initial: Option<Vec<u8>>,
        writes_done: bool,
    ) -> Arc<CallShared> {
        let shared = CallShared::new();
        if let Some(bytes) = initial {
            shared.push_initial(bytes);
        }
        if writes_done {
            shared.mark_writes_done();
        }
        context.attach(&shared);
        match self.registry.lookup(&self.target) {
            Some(server) => server.offer(method, &shared, context.metadata().clone()),
            None => {
                tracing::debug!(address = %self.target, "no server bound, failing call");
                shared.fail_unserved(Status::new(
                    StatusCode::Unavailable,
                    format!("connection refused: {}", self.target),
                ));
            }
        }
        shared
    }

    /// Create a call that is already terminated with `status`, for failures
    /// detected before the transport is involved (e.g. a request that
    /// cannot be encoded).
    pub(crate) fn failed_call(&self, context: &ClientContext, status: Status) -> Arc<CallShared> {
        let shared = CallShared::new();
        context.attach(&shared);
        shared.fail_unserved(status);
        shared
    }
}
