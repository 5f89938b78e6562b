//! Socket wrapper with a cancelable lifecycle scope

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cloneable view on the lifecycle scope of a [`ManagedConnection`].
///
/// Producers keep one to learn when the connection they handed off is gone,
/// and a pairing keeps one per leg to force both legs down together.
#[derive(Debug, Clone)]
pub struct ConnectionEnd {
    token: CancellationToken,
}

impl ConnectionEnd {
    /// Resolves once the connection's scope is canceled, whatever the cause.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Cancel the scope. Whoever holds the stream drops it in response.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One live socket plus the scope that decides when it must go away.
///
/// The scope is a child of the token passed at construction, so canceling
/// the parent ends every connection created under it, while canceling one
/// connection leaves its siblings and the parent untouched.
///
/// The stream can be taken out (the relay does this when a pairing starts);
/// the holder of the stream is then responsible for dropping it once
/// [`ConnectionEnd::wait`] resolves.
#[derive(Debug)]
pub struct ManagedConnection<S = TcpStream> {
    stream: Option<S>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    lifecycle: CancellationToken,
    closed: bool,
}

impl ManagedConnection<TcpStream> {
    /// Wrap an accepted or dialed TCP stream.
    pub fn from_tcp(parent: &CancellationToken, stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        Ok(Self::new(parent, stream, peer_addr, local_addr))
    }
}

impl<S> ManagedConnection<S> {
    pub fn new(
        parent: &CancellationToken,
        stream: S,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            stream: Some(stream),
            peer_addr,
            local_addr,
            lifecycle: parent.child_token(),
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The raw stream, if it has not been taken or closed yet.
    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    /// Move the stream out, leaving the lifecycle scope in place.
    pub fn take_stream(&mut self) -> Option<S> {
        self.stream.take()
    }

    pub fn end_signal(&self) -> ConnectionEnd {
        ConnectionEnd {
            token: self.lifecycle.clone(),
        }
    }

    /// Cancel the lifecycle scope, then drop the stream if still held.
    ///
    /// Returns `true` only for the call that actually closed the connection;
    /// later calls are no-ops.
    pub fn close(&mut self) -> bool {
        self.lifecycle.cancel();
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
        debug!(peer_addr = %self.peer_addr, local_addr = %self.local_addr, "Connection closed");
        true
    }

    /// Wait until the scope is canceled: by [`close`](Self::close), by a
    /// [`ConnectionEnd`] holder, or by the parent token.
    pub async fn await_end(&self) {
        self.lifecycle.cancelled().await
    }

    pub fn is_ended(&self) -> bool {
        self.lifecycle.is_cancelled()
    }
}

impl<S> Drop for ManagedConnection<S> {
    fn drop(&mut self) {
        // Anyone waiting on this connection must observe its end.
        self.lifecycle.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_from_tcp_records_addresses() {
        let parent = CancellationToken::new();
        let (client, server) = tcp_pair().await;
        let expected_peer = server.local_addr().unwrap();

        let conn = ManagedConnection::from_tcp(&parent, client).unwrap();
        assert_eq!(conn.peer_addr(), expected_peer);
        assert!(conn.stream().is_some());
        assert!(!conn.is_ended());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let parent = CancellationToken::new();
        let (client, mut server) = tcp_pair().await;
        let mut conn = ManagedConnection::from_tcp(&parent, client).unwrap();

        assert!(conn.close());
        assert!(!conn.close());
        assert!(!conn.close());
        assert!(conn.is_ended());
        assert!(conn.stream().is_none());

        // The remote side sees EOF once the stream is dropped
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_ends_connection() {
        let parent = CancellationToken::new();
        let (client, _server) = tcp_pair().await;
        let conn = ManagedConnection::from_tcp(&parent, client).unwrap();
        let end = conn.end_signal();

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), conn.await_end())
            .await
            .unwrap();
        assert!(end.is_ended());
    }

    #[tokio::test]
    async fn test_end_signal_does_not_touch_siblings() {
        let parent = CancellationToken::new();
        let (a, _a_peer) = tcp_pair().await;
        let (b, _b_peer) = tcp_pair().await;
        let first = ManagedConnection::from_tcp(&parent, a).unwrap();
        let second = ManagedConnection::from_tcp(&parent, b).unwrap();

        first.end_signal().close();

        assert!(first.is_ended());
        assert!(!second.is_ended());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_drop_ends_scope() {
        let parent = CancellationToken::new();
        let (client, _server) = tcp_pair().await;
        let conn = ManagedConnection::from_tcp(&parent, client).unwrap();
        let end = conn.end_signal();

        drop(conn);
        tokio::time::timeout(Duration::from_secs(1), end.wait())
            .await
            .unwrap();
    }
}
