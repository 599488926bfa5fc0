//! Physical byte-stream transports underneath the tunnel.
//!
//! Tunnels only need an ordered, reliable duplex stream. TCP is the real
//! one; [`MemoryTransport`] wires nodes together in-process for tests and
//! simulations.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::lock;

/// Pipe capacity for in-memory connections.
const MEMORY_PIPE_BYTES: usize = 256 * 1024;

/// Any ordered duplex byte stream.
pub(crate) trait PhysicalStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> PhysicalStream for T {}

pub(crate) type BoxedStream = Box<dyn PhysicalStream>;

/// How a tunnel reaches its peers.
#[derive(Debug, Clone, Default)]
pub enum Transport {
    /// Plain TCP sockets.
    #[default]
    Tcp,
    /// In-process pipes. Every tunnel sharing the same [`MemoryTransport`]
    /// can reach the others by their listen address.
    Memory(MemoryTransport),
}

impl Transport {
    /// Convenience constructor for a fresh in-memory network.
    pub fn memory() -> Self {
        Transport::Memory(MemoryTransport::new())
    }

    pub(crate) async fn listen(&self, address: &str) -> io::Result<Listener> {
        match self {
            Transport::Tcp => Ok(Listener::Tcp(TcpListener::bind(address).await?)),
            Transport::Memory(net) => Ok(Listener::Memory(net.bind(address)?)),
        }
    }

    pub(crate) async fn connect(&self, address: &str) -> io::Result<BoxedStream> {
        match self {
            Transport::Tcp => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Transport::Memory(net) => Ok(Box::new(net.connect(address).await?)),
        }
    }
}

/// A bound listener on either transport.
pub(crate) enum Listener {
    Tcp(TcpListener),
    Memory(MemoryListener),
}

impl Listener {
    /// Wait for the next inbound stream and its remote address.
    pub(crate) async fn accept(&mut self) -> io::Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), remote.to_string()))
            }
            Listener::Memory(listener) => {
                let (stream, remote) = listener.incoming.recv().await.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "memory listener closed")
                })?;
                Ok((Box::new(stream), remote))
            }
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<String> {
        match self {
            Listener::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            Listener::Memory(listener) => Ok(listener.address.clone()),
        }
    }
}

// ── In-memory network ───────────────────────────────────────────────────

type Incoming = mpsc::Sender<(DuplexStream, String)>;

/// A shared in-process "network" of listeners keyed by address.
///
/// Addresses are free-form strings; a `:0` suffix is replaced by a unique
/// port, just like binding TCP to port zero.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<MemoryNet>,
}

#[derive(Default)]
struct MemoryNet {
    listeners: Mutex<HashMap<String, Incoming>>,
    next_port: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses with a live listener.
    pub fn addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = lock(&self.inner.listeners).keys().cloned().collect();
        out.sort();
        out
    }

    fn bind(&self, address: &str) -> io::Result<MemoryListener> {
        let address = match address.strip_suffix(":0") {
            Some(host) => {
                let port = 40_000 + self.inner.next_port.fetch_add(1, Ordering::Relaxed);
                format!("{host}:{port}")
            }
            None => address.to_string(),
        };

        let mut listeners = lock(&self.inner.listeners);
        if listeners.get(&address).is_some_and(|tx| !tx.is_closed()) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{address} already bound"),
            ));
        }
        let (tx, rx) = mpsc::channel(64);
        listeners.insert(address.clone(), tx);

        Ok(MemoryListener {
            address,
            incoming: rx,
            net: Arc::clone(&self.inner),
        })
    }

    async fn connect(&self, address: &str) -> io::Result<DuplexStream> {
        let tx = lock(&self.inner.listeners)
            .get(address)
            .cloned()
            .ok_or_else(|| refused(address))?;

        let (client, server) = tokio::io::duplex(MEMORY_PIPE_BYTES);
        let n = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        tx.send((server, format!("memory-client:{n}")))
            .await
            .map_err(|_| refused(address))?;
        Ok(client)
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("listeners", &lock(&self.inner.listeners).len())
            .finish()
    }
}

fn refused(address: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("no memory listener at {address}"),
    )
}

pub(crate) struct MemoryListener {
    address: String,
    incoming: mpsc::Receiver<(DuplexStream, String)>,
    net: Arc<MemoryNet>,
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        lock(&self.net.listeners).remove(&self.address);
    }
}
