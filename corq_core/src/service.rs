//! Service and method descriptors.
//!
//! A service definition is a set of method descriptors plus a marker type
//! implementing [`ServiceDescriptor`]. Descriptors are declared as constants
//! by the service author and passed by reference to the client call methods
//! and the server listening helpers.

/// The four RPC call shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

/// Identifies one RPC method of one service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub service: &'static str,
    pub name: &'static str,
    pub kind: MethodKind,
}

impl MethodDescriptor {
    #[must_use]
    pub const fn new(service: &'static str, name: &'static str, kind: MethodKind) -> Self {
        MethodDescriptor {
            service,
            name,
            kind,
        }
    }

    /// Full method path, used as the routing key by the transport.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.name)
    }
}

/// Marker trait for a service definition type.
pub trait ServiceDescriptor {
    const NAME: &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING: MethodDescriptor = MethodDescriptor::new("test.Ping", "Ping", MethodKind::Unary);

    #[test]
    fn path_joins_service_and_method() {
        assert_eq!(PING.path(), "/test.Ping/Ping");
    }
}
