//! Contract the cache requires of a pooled connection.

use crate::config::TimeoutHint;

/// A connection that can sit idle in the keep-alive cache.
///
/// The cache owns a connection by value while it is pooled and hands it
/// back by value on [`get`](crate::KeepAliveCache::get), so at any instant
/// exactly one party owns it. Connections that are evicted, expired or
/// refused by the cache are torn down with [`close_server`](Self::close_server)
/// and then dropped.
pub trait KeepAliveConnection: Send + 'static {
    /// Tear down the underlying transport.
    ///
    /// Must tolerate being called more than once. Errors are logged by the
    /// cache and never abort a batch of closes.
    fn close_server(&mut self) -> anyhow::Result<()>;

    /// What the server said about keeping this connection alive.
    fn keep_alive_timeout(&self) -> TimeoutHint {
        TimeoutHint::Unspecified
    }

    /// Whether this connection goes through a proxy.
    fn using_proxy(&self) -> bool {
        false
    }
}

impl<T: KeepAliveConnection + ?Sized> KeepAliveConnection for Box<T> {
    fn close_server(&mut self) -> anyhow::Result<()> {
        (**self).close_server()
    }

    fn keep_alive_timeout(&self) -> TimeoutHint {
        (**self).keep_alive_timeout()
    }

    fn using_proxy(&self) -> bool {
        (**self).using_proxy()
    }
}
