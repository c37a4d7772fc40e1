//! Destination identity used to look up a per-destination queue.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Opaque secondary key component compared by **pointer identity**.
///
/// Typically wraps whatever produced the connection (a socket factory, a TLS
/// configuration, a tenant handle). Clones of one token are equal; two tokens
/// created separately are never equal, even when they wrap equal values.
#[derive(Clone)]
pub struct IdentityToken(Arc<dyn Any + Send + Sync>);

impl IdentityToken {
    /// Wrap `value` in a fresh token with its own identity.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Build a token from an existing shared value. Tokens built from clones
    /// of the same `Arc` are equal.
    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(value)
    }

    /// Borrow the wrapped value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for IdentityToken {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for IdentityToken {}

impl Hash for IdentityToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityToken({:#x})", self.addr())
    }
}

/// Key identifying a keep-alive queue. Idle connections with the same key
/// are interchangeable.
///
/// `protocol`, `host` and `port` compare by value. The optional
/// [`IdentityToken`] compares by pointer: two keys for the same
/// `https://db.local:443` with distinct tokens never share a queue.
#[derive(Clone, Debug)]
pub struct ConnectionKey {
    protocol: String,
    host: String,
    port: u16,
    identity: Option<IdentityToken>,
}

impl ConnectionKey {
    pub fn new(protocol: &str, host: &str, port: u16) -> Self {
        Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            identity: None,
        }
    }

    /// Create a key with an identity token as secondary component.
    pub fn with_identity(protocol: &str, host: &str, port: u16, identity: IdentityToken) -> Self {
        Self {
            identity: Some(identity),
            ..Self::new(protocol, host, port)
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identity(&self) -> Option<&IdentityToken> {
        self.identity.as_ref()
    }
}

impl PartialEq for ConnectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.protocol == other.protocol
            && self.identity == other.identity
    }
}

impl Eq for ConnectionKey {}

impl Hash for ConnectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.identity.as_ref().map_or(0, IdentityToken::addr).hash(state);
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}
