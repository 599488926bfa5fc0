//! Node: overlay membership.
//!
//! Bootstraps peers through the resolver and static list, keeps one control
//! link per peer node, binds every link to the router and hands all other
//! inbound sessions to the data-session stream.
//!
//! Each link runs in one task that reads its control session, feeds adverts
//! to the router and writes the router's per-link queue back out. Outbound
//! links are supervised and redialled with backoff; inbound ones are the
//! dialer's job to restore.

mod control;
mod link;

pub use control::{ControlMessage, CONTROL_CHANNEL};
pub use link::{LinkInfo, LinkState};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use weft_tunnel::{Backoff, Session, Tunnel, TunnelError};

use crate::config::{AdvertiseStrategy, NodeConfig};
use crate::router::{Advert, Route, Router};
use crate::{lock, NetworkError};
use link::LinkHealth;

/// How long either side waits for the other's Hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

// ── Management views ───────────────────────────────────────────────────

/// A node reachable through the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub id: String,
    /// Known only for ourselves and direct peers.
    pub address: Option<String>,
    /// 0 for ourselves, 1 for direct peers.
    pub hops: u32,
}

/// A direct peer and the nodes best reached through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphPeer {
    pub link: LinkInfo,
    pub reachable: Vec<Peer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Graph {
    pub id: String,
    pub address: Option<String>,
    pub network: String,
    pub peers: Vec<GraphPeer>,
}

impl Graph {
    pub fn to_json(&self) -> Result<String, NetworkError> {
        serde_json::to_string_pretty(self).map_err(|e| NetworkError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    /// `connect()` not called yet.
    Idle,
    /// Running with no live link.
    Isolated,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub address: Option<String>,
    pub network: String,
    pub state: NodeState,
    pub strategy: AdvertiseStrategy,
    pub links: usize,
    pub degraded_links: usize,
    pub routes: usize,
    pub services: usize,
}

impl NodeStatus {
    pub fn to_json(&self) -> Result<String, NetworkError> {
        serde_json::to_string(self).map_err(|e| NetworkError::Serialization(e.to_string()))
    }
}

// ── Links ──────────────────────────────────────────────────────────────

#[derive(Clone)]
struct LinkHandle {
    id: String,
    node_id: String,
    address: String,
    outbound: bool,
    health: Arc<Mutex<LinkHealth>>,
    /// Ask the link task to flush its queue and hang up.
    stop: CancellationToken,
    /// Cancelled once the link task has finished.
    done: CancellationToken,
}

impl LinkHandle {
    fn is_live(&self) -> bool {
        !self.done.is_cancelled()
    }

    fn info(&self) -> LinkInfo {
        let health = lock(&self.health);
        LinkInfo {
            id: self.id.clone(),
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            state: health.state(),
            outbound: self.outbound,
            missed_keepalives: health.missed(),
            idle: health.idle_at(Instant::now()),
        }
    }
}

/// A link whose task has not started yet.
struct ActiveLink {
    handle: LinkHandle,
    session: Session,
    adverts: mpsc::Receiver<Advert>,
}

enum Attempt {
    Linked(ActiveLink),
    /// Another link to the same node wins; wait for it to end.
    Duplicate {
        peer: String,
        done: CancellationToken,
    },
}

enum Claim {
    Won(LinkHandle),
    Lost(CancellationToken),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkEnd {
    /// We hung up (shutdown or superseded).
    Closed,
    /// The peer sent Close.
    Remote(String),
    /// Too many missed keepalives.
    TimedOut,
    /// The control session failed.
    Lost(String),
}

impl fmt::Display for LinkEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEnd::Closed => f.write_str("closed locally"),
            LinkEnd::Remote(reason) => write!(f, "closed by peer: {reason}"),
            LinkEnd::TimedOut => f.write_str("keepalives missed"),
            LinkEnd::Lost(reason) => write!(f, "lost: {reason}"),
        }
    }
}

struct PeerHello {
    node_id: String,
    address: String,
    network: String,
}

// ── Node ───────────────────────────────────────────────────────────────

struct NodeInner {
    config: NodeConfig,
    tunnel: Tunnel,
    router: Router,
    /// Remote node id → its control link.
    links: Mutex<HashMap<String, LinkHandle>>,
    /// Addresses with an outbound supervisor running.
    dialing: Mutex<HashSet<String>>,
    /// Address announced to peers, set on connect.
    address: OnceLock<String>,
    data_tx: mpsc::Sender<Session>,
    data_rx: Mutex<Option<mpsc::Receiver<Session>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// One overlay member. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// `tunnel` and `router` must agree with each other and with `config`
    /// on node id and network.
    pub fn new(config: NodeConfig, tunnel: Tunnel, router: Router) -> Result<Self, NetworkError> {
        config.validate()?;
        if tunnel.node_id() != router.node_id() {
            return Err(NetworkError::Config(format!(
                "tunnel node id {} does not match router node id {}",
                tunnel.node_id(),
                router.node_id()
            )));
        }
        if config.network != router.network() {
            return Err(NetworkError::Config(format!(
                "node network {} does not match router network {}",
                config.network,
                router.network()
            )));
        }
        let (data_tx, data_rx) = mpsc::channel(config.data_session_buffer);
        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                tunnel,
                router,
                links: Mutex::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
                address: OnceLock::new(),
                data_tx,
                data_rx: Mutex::new(Some(data_rx)),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        self.inner.tunnel.node_id()
    }

    /// Advertised address, once connected.
    pub fn address(&self) -> Option<&str> {
        self.inner.address.get().map(String::as_str)
    }

    pub fn network(&self) -> &str {
        &self.inner.config.network
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.inner.tunnel
    }

    /// Inbound sessions on any channel but the control one. Can be taken
    /// once; later calls return `None`.
    pub fn data_sessions(&self) -> Option<mpsc::Receiver<Session>> {
        lock(&self.inner.data_rx).take()
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Listen, start the router, and link to every static and resolved
    /// peer. Returns once each peer's first dial attempt has finished;
    /// failed peers keep being retried in the background.
    ///
    /// Finding no peers is not an error: the node stays isolated and
    /// re-resolves every `resolve_interval`.
    pub async fn connect(&self) -> Result<(), NetworkError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(NetworkError::Shutdown);
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let bound = match inner.tunnel.listen(&inner.config.address).await {
            Ok(bound) => bound,
            Err(e) => {
                inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let advertised = inner.config.advertise.clone().unwrap_or_else(|| bound.clone());
        let _ = inner.address.set(advertised.clone());
        tracing::info!(
            "Node {} on network {} listening on {bound}, advertising {advertised}",
            self.id(),
            self.network()
        );

        inner
            .router
            .start(inner.config.registry.clone(), inner.shutdown.clone(), &inner.tasks)
            .await?;
        inner.tasks.spawn(accept_loop(self.clone()));

        let addresses = self.bootstrap().await;
        let linked = self.connect_peers(addresses).await;
        if linked == 0 {
            tracing::info!("Node {} is isolated, retrying discovery periodically", self.id());
        } else {
            tracing::info!("Node {} linked to {linked} peer(s)", self.id());
        }
        inner.tasks.spawn(resolve_loop(self.clone()));
        Ok(())
    }

    /// Link to extra peers by address. Addresses already being dialled and
    /// our own address are skipped. Returns how many new links came up on
    /// the first attempt.
    pub async fn connect_peers<I, S>(&self, addresses: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.inner.shutdown.is_cancelled() {
            return 0;
        }
        let mut pending = Vec::new();
        for address in addresses {
            let address = address.into();
            if self.is_own_address(&address) {
                continue;
            }
            if !lock(&self.inner.dialing).insert(address.clone()) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            self.inner
                .tasks
                .spawn(supervise_outbound(self.clone(), address, tx));
            pending.push(rx);
        }

        let mut linked = 0;
        for rx in pending {
            if matches!(rx.await, Ok(true)) {
                linked += 1;
            }
        }
        linked
    }

    /// Withdraw our routes, let every link flush its final adverts and say
    /// goodbye, then tear the tunnel down.
    pub async fn close(&self) -> Result<(), NetworkError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Ok(());
        }
        let withdrawn = inner.router.withdraw_local();
        tracing::info!("Node {} closing, withdrew {withdrawn} local route(s)", self.id());

        inner.shutdown.cancel();
        inner.tasks.close();
        if tokio::time::timeout(inner.config.shutdown_grace, inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!("Node {} tasks still running after grace period, forcing", self.id());
        }
        inner.tunnel.close().await;

        let remaining = inner
            .config
            .shutdown_timeout
            .saturating_sub(inner.config.shutdown_grace);
        if tokio::time::timeout(remaining, inner.tasks.wait()).await.is_err() {
            return Err(NetworkError::ShutdownTimeout(inner.config.shutdown_timeout));
        }
        tracing::info!("Node {} closed", self.id());
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// Control links, sorted by remote node id.
    pub fn peers(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = lock(&self.inner.links)
            .values()
            .filter(|l| l.is_live())
            .map(LinkHandle::info)
            .collect();
        links.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        links
    }

    /// Ourselves, direct peers, and every node that originates a route we
    /// hold, nearest first.
    pub fn nodes(&self) -> Vec<Peer> {
        let mut reachable: HashMap<String, Peer> = HashMap::new();
        for route in self.inner.router.table() {
            if route.router == self.id() {
                continue;
            }
            let peer = reachable.entry(route.router.clone()).or_insert_with(|| Peer {
                id: route.router.clone(),
                address: None,
                hops: route.metric,
            });
            peer.hops = peer.hops.min(route.metric);
        }
        for link in self.peers().into_iter().filter(|l| l.state.is_up()) {
            reachable.insert(
                link.node_id.clone(),
                Peer {
                    id: link.node_id,
                    address: Some(link.address),
                    hops: 1,
                },
            );
        }

        let mut others: Vec<Peer> = reachable.into_values().collect();
        others.sort_by(|a, b| a.hops.cmp(&b.hops).then_with(|| a.id.cmp(&b.id)));
        let mut nodes = vec![Peer {
            id: self.id().to_string(),
            address: self.address().map(str::to_string),
            hops: 0,
        }];
        nodes.extend(others);
        nodes
    }

    /// Direct peers with the remote nodes each one is our best path to.
    pub fn graph(&self) -> Graph {
        let links = self.peers();
        let direct: HashSet<&str> = links.iter().map(|l| l.node_id.as_str()).collect();

        // Remote router → (metric, gateway) of the best route we hold to it.
        let mut via: HashMap<String, (u32, String)> = HashMap::new();
        for route in self.inner.router.table() {
            if route.router == self.id() || direct.contains(route.router.as_str()) {
                continue;
            }
            match via.get(&route.router) {
                Some((metric, _)) if *metric <= route.metric => {}
                _ => {
                    via.insert(route.router.clone(), (route.metric, route.gateway.clone()));
                }
            }
        }

        let peers = links
            .iter()
            .map(|link| {
                let mut reachable: Vec<Peer> = via
                    .iter()
                    .filter(|(_, (_, gateway))| *gateway == link.node_id)
                    .map(|(id, (metric, _))| Peer {
                        id: id.clone(),
                        address: None,
                        hops: *metric,
                    })
                    .collect();
                reachable.sort_by(|a, b| a.hops.cmp(&b.hops).then_with(|| a.id.cmp(&b.id)));
                GraphPeer {
                    link: link.clone(),
                    reachable,
                }
            })
            .collect();

        Graph {
            id: self.id().to_string(),
            address: self.address().map(str::to_string),
            network: self.network().to_string(),
            peers,
        }
    }

    pub fn routes(&self) -> Vec<Route> {
        self.inner.router.table()
    }

    pub fn services(&self) -> Vec<String> {
        self.inner.router.services()
    }

    pub fn status(&self) -> NodeStatus {
        let links = self.peers();
        let up = links.iter().filter(|l| l.state.is_up()).count();
        let state = if self.inner.shutdown.is_cancelled() {
            NodeState::Closed
        } else if !self.inner.started.load(Ordering::SeqCst) {
            NodeState::Idle
        } else if up == 0 {
            NodeState::Isolated
        } else {
            NodeState::Connected
        };
        let routes = self.inner.router.table();
        NodeStatus {
            id: self.id().to_string(),
            address: self.address().map(str::to_string),
            network: self.network().to_string(),
            state,
            strategy: self.inner.router.strategy(),
            links: up,
            degraded_links: links
                .iter()
                .filter(|l| l.state == LinkState::Degraded)
                .count(),
            routes: routes.len(),
            services: self.inner.router.services().len(),
        }
    }

    // ── Internals ──────────────────────────────────────────────────────

    async fn bootstrap(&self) -> Vec<String> {
        let mut addresses = self.inner.config.nodes.clone();
        if let Some(resolver) = &self.inner.config.resolver {
            match resolver.resolve().await {
                Ok(found) => addresses.extend(found),
                Err(e) => tracing::warn!("Bootstrap via {} resolver failed: {e}", resolver.kind()),
            }
        }
        addresses
    }

    fn is_own_address(&self, address: &str) -> bool {
        self.address() == Some(address)
            || self.inner.tunnel.local_addr().as_deref() == Some(address)
    }

    fn hello(&self) -> ControlMessage {
        ControlMessage::Hello {
            node_id: self.id().to_string(),
            address: self
                .address()
                .unwrap_or(self.inner.config.address.as_str())
                .to_string(),
            network: self.network().to_string(),
        }
    }

    fn check_hello(&self, peer: &str, hello: &PeerHello) -> Result<(), NetworkError> {
        if hello.node_id != peer {
            return Err(NetworkError::Link {
                peer: peer.to_string(),
                reason: format!("hello claims to come from {}", hello.node_id),
            });
        }
        if hello.network != self.network() {
            return Err(NetworkError::NetworkMismatch {
                peer: peer.to_string(),
                network: hello.network.clone(),
            });
        }
        Ok(())
    }

    /// Both ends keep the session dialled by the lower node id, so
    /// simultaneous dials settle on the same link.
    fn prefers(&self, peer: &str, outbound: bool) -> bool {
        outbound == (self.id() < peer)
    }

    /// The live link that a new link to `peer` would lose against.
    fn winning_link(&self, peer: &str, outbound: bool) -> Option<CancellationToken> {
        let links = lock(&self.inner.links);
        let existing = links.get(peer).filter(|l| l.is_live())?;
        if self.prefers(peer, outbound) && !self.prefers(peer, existing.outbound) {
            return None;
        }
        Some(existing.done.clone())
    }

    fn claim(&self, peer: &str, address: &str, outbound: bool) -> Claim {
        let mut links = lock(&self.inner.links);
        if let Some(existing) = links.get(peer).filter(|l| l.is_live()) {
            if !self.prefers(peer, outbound) || self.prefers(peer, existing.outbound) {
                return Claim::Lost(existing.done.clone());
            }
            tracing::info!("Link {} to {peer} superseded", existing.id);
            existing.stop.cancel();
        }
        let handle = LinkHandle {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: peer.to_string(),
            address: address.to_string(),
            outbound,
            health: Arc::new(Mutex::new(LinkHealth::new(
                self.inner.config.keepalive_interval,
                self.inner.config.max_missed_keepalives,
            ))),
            stop: self.inner.shutdown.child_token(),
            done: CancellationToken::new(),
        };
        links.insert(peer.to_string(), handle.clone());
        Claim::Won(handle)
    }

    /// Bind a claimed link to the router; the first advert round is queued.
    fn attach(&self, handle: LinkHandle, session: Session) -> ActiveLink {
        lock(&handle.health).established();
        let adverts = self.inner.router.add_link(&handle.id, &handle.node_id);
        tracing::info!(
            "Link {} to {} at {} up ({})",
            handle.id,
            handle.node_id,
            handle.address,
            if handle.outbound { "outbound" } else { "inbound" }
        );
        ActiveLink {
            handle,
            session,
            adverts,
        }
    }

    async fn dial_link(&self, address: &str) -> Result<Attempt, NetworkError> {
        let mut session = self.inner.tunnel.dial(address, CONTROL_CHANNEL).await?;
        let peer = session.remote_node().to_string();
        if let Some(done) = self.winning_link(&peer, true) {
            let _ = send(&session, &ControlMessage::close("duplicate link")).await;
            return Ok(Attempt::Duplicate { peer, done });
        }

        send(&session, &self.hello()).await?;
        let hello = read_hello(&mut session).await?;
        if let Err(e) = self.check_hello(&peer, &hello) {
            let _ = send(&session, &ControlMessage::close(e.to_string())).await;
            return Err(e);
        }
        match self.claim(&peer, &hello.address, true) {
            Claim::Won(handle) => Ok(Attempt::Linked(self.attach(handle, session))),
            Claim::Lost(done) => {
                let _ = send(&session, &ControlMessage::close("duplicate link")).await;
                Ok(Attempt::Duplicate { peer, done })
            }
        }
    }

    async fn accept_link(&self, mut session: Session) -> Result<Option<ActiveLink>, NetworkError> {
        let peer = session.remote_node().to_string();
        let hello = read_hello(&mut session).await?;
        // Answer before judging so the dialer can check us in turn.
        send(&session, &self.hello()).await?;
        if let Err(e) = self.check_hello(&peer, &hello) {
            let _ = send(&session, &ControlMessage::close(e.to_string())).await;
            return Err(e);
        }
        match self.claim(&peer, &hello.address, false) {
            Claim::Won(handle) => Ok(Some(self.attach(handle, session))),
            Claim::Lost(_) => {
                let _ = send(&session, &ControlMessage::close("duplicate link")).await;
                Ok(None)
            }
        }
    }

    /// Drive one link until it ends, then detach it.
    async fn run_link(&self, link: ActiveLink) -> LinkEnd {
        let ActiveLink {
            handle,
            mut session,
            mut adverts,
        } = link;
        let router = &self.inner.router;

        // The round queued by add_link goes out before the link counts as advertising.
        while let Ok(advert) = adverts.try_recv() {
            if let Err(e) = send(&session, &ControlMessage::Advert(advert)).await {
                let end = LinkEnd::Lost(e.to_string());
                self.finish_link(&handle, &end);
                return end;
            }
        }
        lock(&handle.health).advertising();

        let mut keepalive = tokio::time::interval(self.inner.config.keepalive_interval);
        // Skip the immediate first tick
        keepalive.tick().await;

        let end = loop {
            tokio::select! {
                biased;

                _ = handle.stop.cancelled() => {
                    // Final adverts (our withdrawals on shutdown) go out first.
                    while let Ok(advert) = adverts.try_recv() {
                        if send(&session, &ControlMessage::Advert(advert)).await.is_err() {
                            break;
                        }
                    }
                    let reason = if self.inner.shutdown.is_cancelled() {
                        "shutdown"
                    } else {
                        "superseded"
                    };
                    let _ = send(&session, &ControlMessage::close(reason)).await;
                    break LinkEnd::Closed;
                }

                received = session.recv() => {
                    let bytes = match received {
                        Ok(bytes) => bytes,
                        Err(e) => break LinkEnd::Lost(e.to_string()),
                    };
                    let message = match ControlMessage::from_bytes(&bytes) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!("Bad control message from {}: {e}", handle.node_id);
                            continue;
                        }
                    };
                    if lock(&handle.health).record() == Some(LinkState::Advertising) {
                        tracing::info!("Link {} to {} recovered", handle.id, handle.node_id);
                    }
                    match message {
                        ControlMessage::Advert(advert) => {
                            router.on_advert(&handle.id, advert);
                        }
                        ControlMessage::Keepalive { .. } => {}
                        ControlMessage::Close { reason } => break LinkEnd::Remote(reason),
                        ControlMessage::Hello { .. } => {
                            tracing::debug!("Ignoring repeated hello from {}", handle.node_id);
                        }
                    }
                }

                advert = adverts.recv() => {
                    let Some(advert) = advert else {
                        break LinkEnd::Lost("detached from router".into());
                    };
                    tracing::debug!(
                        "Sending {:?} advert {} ({} route(s)) to {}",
                        advert.operation,
                        advert.sequence,
                        advert.routes.len(),
                        handle.node_id
                    );
                    if let Err(e) = send(&session, &ControlMessage::Advert(advert)).await {
                        break LinkEnd::Lost(e.to_string());
                    }
                }

                _ = keepalive.tick() => {
                    let change = lock(&handle.health).check();
                    match change {
                        Some(LinkState::Disconnected) => break LinkEnd::TimedOut,
                        Some(LinkState::Degraded) => {
                            tracing::warn!("Link {} to {} missed a keepalive", handle.id, handle.node_id);
                        }
                        _ => {}
                    }
                    if let Err(e) = send(&session, &ControlMessage::keepalive()).await {
                        break LinkEnd::Lost(e.to_string());
                    }
                }
            }
        };

        self.finish_link(&handle, &end);
        end
    }

    fn finish_link(&self, handle: &LinkHandle, end: &LinkEnd) {
        {
            let mut health = lock(&handle.health);
            match end {
                LinkEnd::Closed => health.close(),
                _ => health.disconnect(),
            };
        }
        {
            let mut links = lock(&self.inner.links);
            if links.get(&handle.node_id).is_some_and(|l| l.id == handle.id) {
                links.remove(&handle.node_id);
            }
        }
        let withdrawn = self.inner.router.remove_link(&handle.id);
        handle.done.cancel();
        tracing::info!(
            "Link {} to {} {end}, withdrew {} route(s)",
            handle.id,
            handle.node_id,
            withdrawn.len()
        );
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("address", &self.address())
            .field("network", &self.network())
            .field("links", &lock(&self.inner.links).len())
            .finish()
    }
}

// ── Tasks ──────────────────────────────────────────────────────────────

async fn send(session: &Session, message: &ControlMessage) -> Result<(), NetworkError> {
    session.send(&message.to_bytes()?).await?;
    Ok(())
}

async fn read_hello(session: &mut Session) -> Result<PeerHello, NetworkError> {
    let peer = session.remote_node().to_string();
    let bytes = match tokio::time::timeout(HELLO_TIMEOUT, session.recv()).await {
        Ok(received) => received?,
        Err(_) => {
            return Err(NetworkError::Link {
                peer,
                reason: format!("no hello within {HELLO_TIMEOUT:?}"),
            })
        }
    };
    match ControlMessage::from_bytes(&bytes)? {
        ControlMessage::Hello {
            node_id,
            address,
            network,
        } => Ok(PeerHello {
            node_id,
            address,
            network,
        }),
        ControlMessage::Close { reason } => Err(NetworkError::Link { peer, reason }),
        other => Err(NetworkError::Link {
            peer,
            reason: format!("expected hello, got {}", other.kind()),
        }),
    }
}

/// Errors that redialling cannot fix.
fn is_permanent(error: &NetworkError) -> bool {
    match error {
        NetworkError::Tunnel(e) => e.is_auth() || matches!(e, TunnelError::SelfConnection { .. }),
        NetworkError::NetworkMismatch { .. } => true,
        _ => false,
    }
}

fn report(first: &mut Option<oneshot::Sender<bool>>, linked: bool) {
    if let Some(tx) = first.take() {
        let _ = tx.send(linked);
    }
}

/// Keep an outbound link to `address` up until shutdown or until the
/// backoff policy gives up.
async fn supervise_outbound(node: Node, address: String, first: oneshot::Sender<bool>) {
    let shutdown = node.inner.shutdown.clone();
    let mut first = Some(first);
    let mut backoff = Backoff::new(node.inner.config.link_backoff.clone());
    let mut peer: Option<String> = None;

    loop {
        // Linked to this node the other way round: wait for that link.
        if let Some(done) = peer.as_deref().and_then(|p| node.winning_link(p, true)) {
            report(&mut first, true);
            tokio::select! {
                _ = done.cancelled() => {}
                _ = shutdown.cancelled() => break,
            }
        }

        let attempt = tokio::select! {
            attempt = node.dial_link(&address) => attempt,
            _ = shutdown.cancelled() => break,
        };
        match attempt {
            Ok(Attempt::Linked(link)) => {
                report(&mut first, true);
                backoff.reset();
                peer = Some(link.handle.node_id.clone());
                let end = node.run_link(link).await;
                if shutdown.is_cancelled() {
                    break;
                }
                tracing::info!("Link to {address} ended ({end}), redialling");
            }
            Ok(Attempt::Duplicate { peer: remote, done }) => {
                tracing::debug!("Already linked to {remote}, not dialling {address} again yet");
                report(&mut first, true);
                peer = Some(remote);
                if !done.is_cancelled() {
                    continue;
                }
            }
            Err(e) if is_permanent(&e) => {
                tracing::warn!("Not redialling {address}: {e}");
                break;
            }
            Err(e) => {
                report(&mut first, false);
                tracing::warn!("Link to {address} failed: {e}");
            }
        }

        let Some(delay) = backoff.next_delay() else {
            tracing::warn!(
                "Giving up on {address} after {} attempt(s) until the next discovery round",
                backoff.attempts()
            );
            break;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    report(&mut first, false);
    lock(&node.inner.dialing).remove(&address);
}

async fn serve_inbound(node: Node, session: Session) {
    let peer = session.remote_node().to_string();
    let shutdown = node.inner.shutdown.clone();
    let accepted = tokio::select! {
        accepted = node.accept_link(session) => accepted,
        _ = shutdown.cancelled() => return,
    };
    match accepted {
        Ok(Some(link)) => {
            node.run_link(link).await;
        }
        Ok(None) => tracing::debug!("Refused duplicate link from {peer}"),
        Err(e) => tracing::warn!("Inbound link from {peer} refused: {e}"),
    }
}

async fn accept_loop(node: Node) {
    let inner = &node.inner;
    loop {
        let session = tokio::select! {
            accepted = inner.tunnel.accept() => match accepted {
                Ok(session) => session,
                Err(TunnelError::Shutdown) => break,
                Err(e) => {
                    tracing::warn!("Node {} stopped accepting: {e}", node.id());
                    break;
                }
            },
            _ = inner.shutdown.cancelled() => break,
        };

        if session.channel() == CONTROL_CHANNEL {
            inner.tasks.spawn(serve_inbound(node.clone(), session));
        } else if let Err(e) = inner.data_tx.try_send(session) {
            // Dropping the session tells the peer.
            tracing::warn!("Refusing data session: {e}");
        }
    }
}

async fn resolve_loop(node: Node) {
    let shutdown = node.inner.shutdown.clone();
    let mut tick = tokio::time::interval(node.inner.config.resolve_interval);
    // Skip the immediate first tick
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let addresses = node.bootstrap().await;
                let linked = node.connect_peers(addresses).await;
                if linked > 0 {
                    tracing::info!("Node {} linked to {linked} newly discovered peer(s)", node.id());
                } else if node.peers().is_empty() {
                    tracing::debug!("Node {} still isolated", node.id());
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use weft_tunnel::{Transport, TunnelConfig};

    use super::*;
    use crate::config::RouterConfig;

    fn parts(id: &str, transport: &Transport) -> (Tunnel, Router) {
        let tunnel = Tunnel::new(TunnelConfig::new(id).transport(transport.clone())).unwrap();
        let router = Router::new(RouterConfig::new(id)).unwrap();
        (tunnel, router)
    }

    #[tokio::test]
    async fn rejects_mismatched_parts() {
        let transport = Transport::memory();
        let tunnel = Tunnel::new(TunnelConfig::new("a1").transport(transport.clone())).unwrap();
        let router = Router::new(RouterConfig::new("b1")).unwrap();
        assert!(matches!(
            Node::new(NodeConfig::new(), tunnel, router),
            Err(NetworkError::Config(_))
        ));

        let (tunnel, router) = parts("a1", &transport);
        assert!(matches!(
            Node::new(NodeConfig::new().network("other"), tunnel, router),
            Err(NetworkError::Config(_))
        ));
    }

    #[tokio::test]
    async fn idle_node_reports_itself_only() {
        let transport = Transport::memory();
        let (tunnel, router) = parts("a1", &transport);
        let node = Node::new(NodeConfig::new(), tunnel, router).unwrap();

        assert_eq!(node.status().state, NodeState::Idle);
        assert!(node.peers().is_empty());
        let nodes = node.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "a1");
        assert_eq!(nodes[0].hops, 0);
        assert!(node.data_sessions().is_some());
        assert!(node.data_sessions().is_none());
    }

    #[tokio::test]
    async fn isolated_after_connect_without_peers() {
        let transport = Transport::memory();
        let (tunnel, router) = parts("a1", &transport);
        let node = Node::new(NodeConfig::new().address("a1:0"), tunnel, router).unwrap();
        node.connect().await.unwrap();

        let status = node.status();
        assert_eq!(status.state, NodeState::Isolated);
        assert!(status.address.is_some());
        assert!(status.to_json().unwrap().contains("\"Isolated\""));

        node.close().await.unwrap();
        assert_eq!(node.status().state, NodeState::Closed);
        assert!(matches!(node.connect().await, Err(NetworkError::Shutdown)));
    }

    #[tokio::test]
    async fn lower_id_dial_is_preferred_on_both_ends() {
        let transport = Transport::memory();
        let (tunnel, router) = parts("a1", &transport);
        let a1 = Node::new(NodeConfig::new(), tunnel, router).unwrap();
        let (tunnel, router) = parts("b1", &transport);
        let b1 = Node::new(NodeConfig::new(), tunnel, router).unwrap();

        // The session a1 dialled: outbound at a1, inbound at b1.
        assert!(a1.prefers("b1", true));
        assert!(b1.prefers("a1", false));
        // The session b1 dialled loses on both ends.
        assert!(!b1.prefers("a1", true));
        assert!(!a1.prefers("b1", false));
    }

    #[tokio::test]
    async fn link_advertises_only_after_first_round_is_sent() {
        let transport = Transport::memory();
        let (tunnel, router) = parts("a1", &transport);
        router.add_local_route("echo", "10.0.0.1:9000");
        let node = Node::new(NodeConfig::new(), tunnel.clone(), router).unwrap();
        let peer = Tunnel::new(TunnelConfig::new("b1").transport(transport.clone())).unwrap();
        let addr = peer.listen("b1:0").await.unwrap();

        let session = tunnel.dial(&addr, CONTROL_CHANNEL).await.unwrap();
        let mut at_peer = peer.accept().await.unwrap();
        let Claim::Won(handle) = node.claim("b1", &addr, true) else {
            panic!("no competing link");
        };
        let link = node.attach(handle.clone(), session);
        assert_eq!(lock(&handle.health).state(), LinkState::Established);

        let task = {
            let node = node.clone();
            tokio::spawn(async move { node.run_link(link).await })
        };
        let first = ControlMessage::from_bytes(&at_peer.recv().await.unwrap()).unwrap();
        let ControlMessage::Advert(advert) = first else {
            panic!("expected an advert first");
        };
        assert_eq!(advert.routes[0].service, "echo");

        tokio::time::timeout(Duration::from_secs(5), async {
            while lock(&handle.health).state() != LinkState::Advertising {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("link never reached Advertising");

        handle.stop.cancel();
        assert_eq!(task.await.unwrap(), LinkEnd::Closed);
        tunnel.close().await;
        peer.close().await;
    }

    #[test]
    fn permanent_errors() {
        assert!(is_permanent(&NetworkError::NetworkMismatch {
            peer: "b1".into(),
            network: "other".into(),
        }));
        assert!(is_permanent(&NetworkError::Tunnel(TunnelError::Auth {
            peer: "b1".into(),
            reason: "token".into(),
        })));
        assert!(!is_permanent(&NetworkError::Link {
            peer: "b1".into(),
            reason: "hung up".into(),
        }));
    }
}
