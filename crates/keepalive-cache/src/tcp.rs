//! [`KeepAliveConnection`] over a plain TCP stream.
//!
//! The cache never reads or writes through the stream; it only needs to tear
//! it down when the connection is evicted or expires.

use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};

use anyhow::Context;

use crate::config::TimeoutHint;
use crate::connection::KeepAliveConnection;

/// An established TCP connection that can be parked in the cache.
pub struct TcpConnection {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    keep_alive: TimeoutHint,
    via_proxy: bool,
}

impl TcpConnection {
    /// Wrap an established stream. The keep-alive hint defaults to
    /// [`TimeoutHint::Unspecified`].
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream: Some(stream),
            peer,
            keep_alive: TimeoutHint::Unspecified,
            via_proxy: false,
        }
    }

    /// Builder method: record what the server said about keep-alive.
    pub fn with_keep_alive(self, keep_alive: TimeoutHint) -> Self {
        Self { keep_alive, ..self }
    }

    /// Builder method: mark the connection as going through a proxy.
    pub fn via_proxy(self, via_proxy: bool) -> Self {
        Self { via_proxy, ..self }
    }

    /// Borrow the stream; `None` once the connection has been closed.
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Take the stream back out, e.g. to reuse it after `get`.
    pub fn into_stream(mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl KeepAliveConnection for TcpConnection {
    fn close_server(&mut self) -> anyhow::Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Peer already went away; nothing left to tear down.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e).with_context(|| format!("tcp shutdown {:?}", self.peer)),
        }
    }

    fn keep_alive_timeout(&self) -> TimeoutHint {
        self.keep_alive
    }

    fn using_proxy(&self) -> bool {
        self.via_proxy
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("keep_alive", &self.keep_alive)
            .field("via_proxy", &self.via_proxy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    fn connected_pair() -> (TcpConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (TcpConnection::new(client), server)
    }

    #[test]
    fn close_shuts_down_stream() {
        let (mut conn, mut server) = connected_pair();
        assert!(!conn.is_closed());
        conn.close_server().unwrap();
        assert!(conn.is_closed());

        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 8];
        let n = server.read(&mut buf).expect("read after peer shutdown");
        assert_eq!(n, 0, "server sees EOF");
    }

    #[test]
    fn close_twice_is_harmless() {
        let (mut conn, _server) = connected_pair();
        conn.close_server().unwrap();
        conn.close_server().unwrap();
    }

    #[test]
    fn builder_sets_hint_and_proxy() {
        let (conn, _server) = connected_pair();
        let conn = conn
            .with_keep_alive(TimeoutHint::Negotiated(Duration::from_secs(30)))
            .via_proxy(true);
        assert_eq!(
            conn.keep_alive_timeout(),
            TimeoutHint::Negotiated(Duration::from_secs(30))
        );
        assert!(conn.using_proxy());
    }

    #[test]
    fn into_stream_returns_open_stream() {
        let (conn, _server) = connected_pair();
        let stream = conn.into_stream().expect("stream still open");
        assert!(stream.peer_addr().is_ok());
    }
}
