//! Transport abstraction for stream-oriented connections.
//!
//! Elvin runs over a single ordered byte stream per connection. Production
//! uses TCP through tokio; the simulation harness plugs in turmoil's TCP so
//! whole router/client scenarios run deterministically in one process.

use std::io;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};

/// Outbound connection factory.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Byte stream to a router.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a stream to `address` (`host:port`).
    async fn connect(&self, address: &str) -> io::Result<Self::Stream>;
}

/// Inbound connection source.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Byte stream from a client.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection, returning its stream and peer address.
    async fn accept(&self) -> io::Result<(Self::Stream, String)>;

    /// Address this listener is bound to.
    fn local_addr(&self) -> io::Result<String>;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn connect(&self, address: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(strip_scheme(address)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Plain TCP listener.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to `address` (`host:port`).
    pub async fn bind(address: &str) -> io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(strip_scheme(address)).await? })
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        self.listener.local_addr().map(|addr| addr.to_string())
    }
}

/// Accept `elvin://host:port` as well as a bare `host:port`.
pub fn strip_scheme(address: &str) -> &str {
    address.strip_prefix("elvin://").unwrap_or(address)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn scheme_prefix_is_optional() {
        assert_eq!(strip_scheme("elvin://router:2917"), "router:2917");
        assert_eq!(strip_scheme("router:2917"), "router:2917");
    }

    #[tokio::test]
    async fn tcp_round_trip() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let address = acceptor.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpTransport.connect(&address).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let (mut stream, peer) = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(peer.starts_with("127.0.0.1:"));
        client.await.unwrap();
    }
}
