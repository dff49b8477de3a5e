//! Turmoil TCP transport.
//!
//! Hosts are addressed by turmoil host name, e.g. `router:2917` or
//! `elvin://router:2917`.

use std::io;

use async_trait::async_trait;
use elvin_core::{Listener, Transport, transport::strip_scheme};
use turmoil::net::{TcpListener, TcpStream};

/// Connector for turmoil hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimTransport;

impl SimTransport {
    /// Open a stream to `address` directly.
    pub async fn connect_to(address: &str) -> io::Result<TcpStream> {
        TcpStream::connect(strip_scheme(address)).await
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Stream = TcpStream;

    async fn connect(&self, address: &str) -> io::Result<TcpStream> {
        Self::connect_to(address).await
    }
}

/// Listener on a turmoil host.
pub struct SimListener {
    listener: TcpListener,
}

impl std::fmt::Debug for SimListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimListener").finish_non_exhaustive()
    }
}

impl SimListener {
    /// Bind to `address` on the current host, e.g. `0.0.0.0:2917`.
    pub async fn bind(address: &str) -> io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(strip_scheme(address)).await? })
    }
}

#[async_trait]
impl Listener for SimListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((stream, peer.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        self.listener.local_addr().map(|address| address.to_string())
    }
}
