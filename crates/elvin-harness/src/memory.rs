//! In-process network of duplex pipes.
//!
//! A [`MemoryNetwork`] maps addresses to listeners. Connecting to an address
//! creates a tokio duplex pair and hands one end to that address's
//! listener; an address with no listener refuses the connection.
//!
//! [`MemoryNetwork::sever`] stops an address from accepting, which lets a
//! test hold a client in its reconnect loop, and [`MemoryNetwork::dials`]
//! counts connection attempts per address.

use std::{collections::HashMap, io, sync::Arc};

use async_trait::async_trait;
use elvin_core::{Listener, Transport, transport::strip_scheme};
use parking_lot::Mutex;
use tokio::{
    io::DuplexStream,
    sync::{Mutex as AsyncMutex, mpsc},
};

/// Pipe buffer size for each direction.
const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Default)]
struct Table {
    listeners: HashMap<String, mpsc::UnboundedSender<(DuplexStream, String)>>,
    dials: HashMap<String, usize>,
    next_peer: u32,
}

/// Shared address table.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    table: Arc<Mutex<Table>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections for `address`, replacing any listener
    /// already there.
    pub fn listen(&self, address: &str) -> MemoryListener {
        let (accept, incoming) = mpsc::unbounded_channel();
        let address = strip_scheme(address).to_owned();
        self.table.lock().listeners.insert(address.clone(), accept);
        MemoryListener { address, incoming: AsyncMutex::new(incoming) }
    }

    /// Refuse new connections to `address`. Established ones stay open.
    pub fn sever(&self, address: &str) {
        self.table.lock().listeners.remove(strip_scheme(address));
    }

    /// Connection attempts made to `address` so far.
    pub fn dials(&self, address: &str) -> usize {
        self.table.lock().dials.get(strip_scheme(address)).copied().unwrap_or(0)
    }

    /// Connector for this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { network: self.clone() }
    }
}

/// Connector for a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    type Stream = DuplexStream;

    async fn connect(&self, address: &str) -> io::Result<DuplexStream> {
        let address = strip_scheme(address);
        let mut table = self.network.table.lock();
        *table.dials.entry(address.to_owned()).or_default() += 1;
        table.next_peer += 1;
        let peer = format!("memory:{}", table.next_peer);

        let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listening on {address}"));
        let listener = table.listeners.get(address).ok_or_else(refused)?;
        let (client, router) = tokio::io::duplex(PIPE_CAPACITY);
        listener.send((router, peer)).map_err(|_| refused())?;
        Ok(client)
    }
}

/// Accepting end for one address.
#[derive(Debug)]
pub struct MemoryListener {
    address: String,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<(DuplexStream, String)>>,
}

#[async_trait]
impl Listener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&self) -> io::Result<(DuplexStream, String)> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network dropped"))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn connect_reaches_listener() {
        let network = MemoryNetwork::new();
        let listener = network.listen("elvin://router:2917");
        let mut client = network.transport().connect("router:2917").await.unwrap();
        let (mut server, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("memory:"));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(network.dials("router:2917"), 1);
    }

    #[tokio::test]
    async fn severed_address_refuses() {
        let network = MemoryNetwork::new();
        let _listener = network.listen("router:2917");
        network.sever("router:2917");
        let error = network.transport().connect("router:2917").await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(network.dials("router:2917"), 1);
    }
}
