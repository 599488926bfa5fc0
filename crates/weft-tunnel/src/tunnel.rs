use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backoff::Backoff;
use crate::connection::{Connection, ConnectionMeta};
use crate::event::{ConnectionEvent, ConnectionInfo};
use crate::handshake::{self, Role};
use crate::session::Session;
use crate::transport::{BoxedStream, Listener};
use crate::{lock, TunnelConfig, TunnelError};

/// Connection lifecycle broadcast capacity.
const EVENT_CAPACITY: usize = 256;

/// How long `close()` waits for connection tasks to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Authenticated, encrypted, multiplexed tunnel endpoint.
///
/// Cheap to clone; all clones share the same connections.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

struct TunnelInner {
    config: TunnelConfig,
    /// Live outbound connection per dialled address.
    dialed: Mutex<HashMap<String, Arc<Connection>>>,
    /// Serializes concurrent dials to the same address.
    dial_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Every live connection, inbound and outbound.
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    accept_tx: mpsc::Sender<Session>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Session>>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    next_id: AtomicU64,
    listen_addr: Mutex<Option<String>>,
}

impl Tunnel {
    /// Create a tunnel endpoint. Nothing is bound until [`listen`](Self::listen).
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_buffer);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(TunnelInner {
                config,
                dialed: Mutex::new(HashMap::new()),
                dial_locks: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                accept_tx,
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                events,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                next_id: AtomicU64::new(1),
                listen_addr: Mutex::new(None),
            }),
        })
    }

    /// Our node id.
    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// Bound listen address, once listening.
    pub fn local_addr(&self) -> Option<String> {
        lock(&self.inner.listen_addr).clone()
    }

    /// Bind `address` and start accepting peers. Returns the bound address.
    pub async fn listen(&self, address: &str) -> Result<String, TunnelError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TunnelError::Shutdown);
        }
        let listener = self
            .inner
            .config
            .transport
            .listen(address)
            .await
            .map_err(|source| TunnelError::Bind {
                address: address.to_string(),
                source,
            })?;
        let bound = listener.local_addr()?;
        *lock(&self.inner.listen_addr) = Some(bound.clone());

        tracing::info!("Tunnel {} listening on {bound}", self.node_id());
        self.inner
            .tasks
            .spawn(accept_loop(Arc::downgrade(&self.inner), listener, self.inner.shutdown.clone()));
        Ok(bound)
    }

    /// Open a session on `channel` to the node at `address`, connecting
    /// first if needed.
    pub async fn dial(&self, address: &str, channel: &str) -> Result<Session, TunnelError> {
        let conn = self.inner.get_or_connect(address).await?;
        conn.open_session(channel).await
    }

    /// Make sure a connection to `address` exists and return the node id
    /// behind it.
    pub async fn connect(&self, address: &str) -> Result<String, TunnelError> {
        let conn = self.inner.get_or_connect(address).await?;
        Ok(conn.remote_node.clone())
    }

    /// Open a session to an already connected node, by node id.
    pub async fn open(&self, node_id: &str, channel: &str) -> Result<Session, TunnelError> {
        let conn = {
            let connections = lock(&self.inner.connections);
            let mut candidates: Vec<&Arc<Connection>> = connections
                .values()
                .filter(|c| c.remote_node == node_id && !c.is_closed())
                .collect();
            // Prefer our own dials, then the oldest connection.
            candidates.sort_by_key(|c| (!c.is_outbound(), c.id));
            candidates.first().map(|c| Arc::clone(c))
        };
        match conn {
            Some(conn) => conn.open_session(channel).await,
            None => Err(TunnelError::NoConnection {
                node_id: node_id.to_string(),
            }),
        }
    }

    /// Wait for the next session a peer opens, on any channel.
    pub async fn accept(&self) -> Result<Session, TunnelError> {
        let mut rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            session = rx.recv() => session.ok_or(TunnelError::Shutdown),
            _ = self.inner.shutdown.cancelled() => Err(TunnelError::Shutdown),
        }
    }

    /// Live connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut out: Vec<ConnectionInfo> = lock(&self.inner.connections)
            .values()
            .filter(|c| !c.is_closed())
            .map(|c| c.info())
            .collect();
        out.sort_by_key(|info| info.id);
        out
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Drop every connection to `node_id` without redialling.
    /// Returns the number of connections closed.
    pub fn disconnect(&self, node_id: &str) -> usize {
        lock(&self.inner.dialed).retain(|_, c| c.remote_node != node_id);
        let victims: Vec<Arc<Connection>> = lock(&self.inner.connections)
            .values()
            .filter(|c| c.remote_node == node_id)
            .cloned()
            .collect();
        for conn in &victims {
            conn.shutdown();
        }
        victims.len()
    }

    /// Close every connection and stop listening.
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        lock(&self.inner.dialed).clear();
        let all: Vec<Arc<Connection>> = lock(&self.inner.connections).drain().map(|(_, c)| c).collect();
        for conn in &all {
            conn.shutdown();
        }

        self.inner.tasks.close();
        if tokio::time::timeout(CLOSE_GRACE, self.inner.tasks.wait()).await.is_err() {
            tracing::debug!("Tunnel {} closed with tasks still running", self.node_id());
        }
        tracing::info!("Tunnel {} closed", self.node_id());
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("node_id", &self.node_id())
            .field("listen_addr", &self.local_addr())
            .field("connections", &lock(&self.inner.connections).len())
            .finish()
    }
}

impl TunnelInner {
    async fn get_or_connect(self: &Arc<Self>, address: &str) -> Result<Arc<Connection>, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Shutdown);
        }
        if let Some(conn) = self.live_dial(address) {
            return Ok(conn);
        }

        let dial_lock = Arc::clone(
            lock(&self.dial_locks)
                .entry(address.to_string())
                .or_default(),
        );
        let _guard = dial_lock.lock().await;

        // Another caller may have connected while we waited.
        if let Some(conn) = self.live_dial(address) {
            return Ok(conn);
        }
        let conn = self.connect(address).await?;
        lock(&self.dialed).insert(address.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    fn live_dial(&self, address: &str) -> Option<Arc<Connection>> {
        lock(&self.dialed)
            .get(address)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    fn is_current_dial(&self, address: &str, id: u64) -> bool {
        lock(&self.dialed).get(address).is_some_and(|c| c.id == id)
    }

    async fn connect(self: &Arc<Self>, address: &str) -> Result<Arc<Connection>, TunnelError> {
        let config = &self.config;
        let attempt = async {
            let mut stream = config
                .transport
                .connect(address)
                .await
                .map_err(|source| TunnelError::Dial {
                    address: address.to_string(),
                    source,
                })?;
            let established =
                handshake::perform(&mut stream, &config.node_id, &config.token, Role::Initiator, address)
                    .await?;
            Ok::<_, TunnelError>((stream, established))
        };

        let (stream, established) = match tokio::time::timeout(config.dial_timeout, attempt).await {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                if e.is_auth() {
                    tracing::warn!(target: "weft::security", "Handshake with {address} rejected: {e}");
                }
                return Err(e);
            }
            Err(_) => {
                return Err(TunnelError::Timeout {
                    address: address.to_string(),
                })
            }
        };

        if established.remote_id == config.node_id {
            return Err(TunnelError::SelfConnection {
                address: address.to_string(),
            });
        }

        let local_addr = lock(&self.listen_addr).clone().unwrap_or_default();
        let conn = self.register(
            stream,
            established,
            local_addr,
            address.to_string(),
            Some(address.to_string()),
        );
        tracing::debug!("Tunnel {} connected to {} at {address}", config.node_id, conn.remote_node);
        Ok(conn)
    }

    async fn admit(self: Arc<Self>, mut stream: BoxedStream, remote_addr: String) {
        let config = &self.config;
        let handshake = handshake::perform(
            &mut stream,
            &config.node_id,
            &config.token,
            Role::Responder,
            &remote_addr,
        );
        let established = match tokio::time::timeout(config.dial_timeout, handshake).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) if e.is_auth() => {
                tracing::warn!(target: "weft::security", "Rejected peer at {remote_addr}: {e}");
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!("Inbound handshake from {remote_addr} failed: {e}");
                return;
            }
            Err(_) => {
                tracing::debug!("Inbound handshake from {remote_addr} timed out");
                return;
            }
        };

        if established.remote_id == config.node_id {
            tracing::debug!("Dropping inbound self-connection from {remote_addr}");
            return;
        }

        let local_addr = lock(&self.listen_addr).clone().unwrap_or_default();
        let conn = self.register(stream, established, local_addr, remote_addr, None);
        tracing::debug!(
            "Tunnel {} accepted {} from {}",
            config.node_id,
            conn.remote_node,
            conn.remote_addr
        );
    }

    fn register(
        self: &Arc<Self>,
        stream: BoxedStream,
        established: handshake::Established,
        local_addr: String,
        remote_addr: String,
        dial_address: Option<String>,
    ) -> Arc<Connection> {
        let meta = ConnectionMeta {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            local_addr,
            remote_addr,
            dial_address,
            max_message_size: self.config.max_message_size,
            session_buffer: self.config.session_buffer,
        };
        let conn = Connection::spawn(stream, established, meta, self.accept_tx.clone(), &self.tasks);
        lock(&self.connections).insert(conn.id, Arc::clone(&conn));

        let _ = self.events.send(ConnectionEvent::Up {
            node_id: conn.remote_node.clone(),
            address: conn.remote_addr.clone(),
            outbound: conn.is_outbound(),
        });
        self.tasks
            .spawn(supervise(Arc::downgrade(self), Arc::clone(&conn), self.shutdown.clone()));
        conn
    }
}

async fn accept_loop(inner: Weak<TunnelInner>, mut listener: Listener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };
        let Some(this) = inner.upgrade() else { break };
        match accepted {
            Ok((stream, remote)) => {
                this.tasks.spawn(Arc::clone(&this).admit(stream, remote));
            }
            Err(e) => {
                tracing::warn!("Accept failed on {}: {e}", this.config.node_id);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Watch one connection; on loss, emit `Down` and redial outbound ones.
async fn supervise(inner: Weak<TunnelInner>, conn: Arc<Connection>, shutdown: CancellationToken) {
    let closed = conn.closed_token();
    tokio::select! {
        _ = closed.cancelled() => {}
        _ = shutdown.cancelled() => return,
    }

    let Some(this) = inner.upgrade() else { return };
    lock(&this.connections).remove(&conn.id);
    let _ = this.events.send(ConnectionEvent::Down {
        node_id: conn.remote_node.clone(),
        address: conn.remote_addr.clone(),
    });
    tracing::debug!("Connection {} to {} down", conn.id, conn.remote_node);

    let Some(address) = conn.dial_address.clone() else { return };
    if shutdown.is_cancelled() || !this.is_current_dial(&address, conn.id) {
        return;
    }
    let mut backoff = Backoff::new(this.config.reconnect.clone());
    drop(this);

    loop {
        let Some(delay) = backoff.next_delay() else {
            lost(&inner, &address, backoff.attempts());
            return;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return,
        }
        let Some(this) = inner.upgrade() else { return };
        match this.get_or_connect(&address).await {
            Ok(fresh) => {
                tracing::info!(
                    "Reconnected to {} at {address} after {} attempt(s)",
                    fresh.remote_node,
                    backoff.attempts()
                );
                let _ = this.events.send(ConnectionEvent::Reconnected {
                    node_id: fresh.remote_node.clone(),
                    address: address.clone(),
                    attempts: backoff.attempts(),
                });
                return;
            }
            Err(e) if e.is_auth() || matches!(e, TunnelError::Shutdown) => {
                lost(&inner, &address, backoff.attempts());
                return;
            }
            Err(e) => {
                tracing::debug!("Redial {address} attempt {} failed: {e}", backoff.attempts());
            }
        }
    }
}

fn lost(inner: &Weak<TunnelInner>, address: &str, attempts: u32) {
    tracing::warn!("Giving up on {address} after {attempts} attempt(s)");
    if let Some(this) = inner.upgrade() {
        lock(&this.dialed).remove(address);
        let _ = this.events.send(ConnectionEvent::Lost {
            address: address.to_string(),
            attempts,
        });
    }
}
