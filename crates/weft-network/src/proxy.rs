//! Proxy: RPC forwarding across the overlay.
//!
//! A call is served by a local handler when one is registered, otherwise it
//! goes to the gateway of the best route, then the next best, over `rpc`
//! sessions. The server side answers inbound `rpc` sessions with the same
//! logic, so a call crosses as many hops as the routes it follows.
//!
//! Forwarding never touches the routing table.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use weft_tunnel::{Session, Tunnel, TunnelError};

use crate::config::ProxyConfig;
use crate::router::Router;
use crate::{lock, NetworkError};

/// Tunnel channel carrying calls.
pub const RPC_CHANNEL: &str = "rpc";

/// Idle sessions parked per gateway.
const IDLE_PER_PEER: usize = 4;

// ── Wire types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub service: String,
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    /// Proxies this request has been forwarded by.
    #[serde(default)]
    pub hops: u32,
    /// Caller budget left when the request was forwarded, in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl Request {
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            body: body.into(),
            hops: 0,
            deadline_ms: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }
}

/// Why a hop could not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Failure {
    Handler { message: String },
    RouteNotFound,
    TooManyHops { hops: u32 },
    Timeout,
    Unavailable { reason: String },
}

impl Failure {
    fn from_error(error: &NetworkError) -> Self {
        match error {
            NetworkError::Remote { message, .. } => Failure::Handler {
                message: message.clone(),
            },
            NetworkError::RouteNotFound { .. } => Failure::RouteNotFound,
            NetworkError::TooManyHops { hops, .. } => Failure::TooManyHops { hops: *hops },
            NetworkError::Timeout { .. } => Failure::Timeout,
            other => Failure::Unavailable {
                reason: other.to_string(),
            },
        }
    }

    /// The error as seen by the caller of `gateway`. A gateway that cannot
    /// reach the service is just a failed candidate.
    fn into_error(self, service: &str, gateway: &str) -> NetworkError {
        match self {
            Failure::Handler { message } => NetworkError::Remote {
                service: service.to_string(),
                message,
            },
            Failure::RouteNotFound => NetworkError::Link {
                peer: gateway.to_string(),
                reason: format!("no route to {service} beyond {gateway}"),
            },
            Failure::TooManyHops { hops } => NetworkError::TooManyHops {
                service: service.to_string(),
                hops,
            },
            Failure::Timeout => NetworkError::Timeout {
                service: service.to_string(),
            },
            Failure::Unavailable { reason } => NetworkError::Link {
                peer: gateway.to_string(),
                reason,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum ProxyMessage {
    Request(Request),
    Response(Response),
    Failure(Failure),
}

impl ProxyMessage {
    fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ── Handlers ───────────────────────────────────────────────────────────

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Serves calls for a service hosted on this node.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError>;
}

/// [`Handler`] backed by an async closure.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        (self.0)(request).await
    }
}

// ── Proxy ──────────────────────────────────────────────────────────────

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overall deadline; the configured request timeout when unset.
    pub timeout: Option<Duration>,
    /// Named link to use instead of a route lookup.
    pub link: Option<String>,
}

impl CallOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn link(mut self, name: impl Into<String>) -> Self {
        self.link = Some(name.into());
        self
    }
}

struct ProxyInner {
    config: ProxyConfig,
    tunnel: Tunnel,
    router: Router,
    handlers: Mutex<HashMap<String, Arc<dyn Handler>>>,
    /// (gateway node id, channel) → parked sessions.
    idle: Mutex<LruCache<(String, String), Vec<Session>>>,
}

/// RPC forwarder. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, tunnel: Tunnel, router: Router) -> Result<Self, NetworkError> {
        config.validate()?;
        if tunnel.node_id() != router.node_id() {
            return Err(NetworkError::Config(format!(
                "tunnel node id {} does not match router node id {}",
                tunnel.node_id(),
                router.node_id()
            )));
        }
        let capacity = NonZeroUsize::new(config.session_cache).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            inner: Arc::new(ProxyInner {
                config,
                tunnel,
                router,
                handlers: Mutex::new(HashMap::new()),
                idle: Mutex::new(LruCache::new(capacity)),
            }),
        })
    }

    /// Serve `service` locally. Replaces any previous handler.
    pub fn register_handler(&self, service: impl Into<String>, handler: impl Handler) {
        let service = service.into();
        tracing::debug!("Proxy handler registered for {service}");
        lock(&self.inner.handlers).insert(service, Arc::new(handler));
    }

    pub fn deregister_handler(&self, service: &str) -> bool {
        lock(&self.inner.handlers).remove(service).is_some()
    }

    pub async fn call(&self, request: Request) -> Result<Response, NetworkError> {
        self.call_with(request, CallOptions::default()).await
    }

    /// Route `request` and wait for its response within the deadline.
    /// Dropping the future abandons the call and closes its session.
    pub async fn call_with(
        &self,
        request: Request,
        options: CallOptions,
    ) -> Result<Response, NetworkError> {
        let budget = options.timeout.unwrap_or(self.inner.config.request_timeout);
        let service = request.service.clone();
        let call = self.dispatch(request, deadline_after(budget), options.link.as_deref(), None);
        match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout { service }),
        }
    }

    /// Answer inbound `rpc` sessions until `sessions` ends or `shutdown`.
    /// Sessions on other channels are refused.
    pub async fn serve(&self, mut sessions: mpsc::Receiver<Session>, shutdown: CancellationToken) {
        let tasks = TaskTracker::new();
        loop {
            let session = tokio::select! {
                session = sessions.recv() => match session {
                    Some(session) => session,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            if session.channel() != RPC_CHANNEL {
                tracing::debug!(
                    "Refusing session on channel {} from {}",
                    session.channel(),
                    session.remote_node()
                );
                continue;
            }
            tasks.spawn(serve_session(self.clone(), session, shutdown.clone()));
        }
        tasks.close();
        tasks.wait().await;
    }

    /// Parked sessions across all gateways.
    pub fn idle_sessions(&self) -> usize {
        lock(&self.inner.idle).iter().map(|(_, s)| s.len()).sum()
    }

    // ── Internals ──────────────────────────────────────────────────────

    /// Local handler, else forward. `from` is the node that handed us the
    /// call, never used as its next hop.
    async fn dispatch(
        &self,
        request: Request,
        deadline: Instant,
        link: Option<&str>,
        from: Option<&str>,
    ) -> Result<Response, NetworkError> {
        let service = request.service.clone();
        if request.hops > self.inner.config.max_hops {
            return Err(NetworkError::TooManyHops {
                service,
                hops: request.hops,
            });
        }

        if link.is_none() {
            let handler = lock(&self.inner.handlers).get(&service).cloned();
            if let Some(handler) = handler {
                tracing::debug!("Serving {service}/{} locally", request.endpoint);
                return handler
                    .handle(request)
                    .await
                    .map_err(|e| NetworkError::Remote {
                        service,
                        message: e.to_string(),
                    });
            }
        }

        let gateways = self.candidates(&service, link, from)?;
        let attempts = gateways.len().min(self.inner.config.max_attempts);
        let mut last = None;
        for gateway in gateways.iter().take(attempts) {
            match self.forward(gateway, &request, deadline).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Forwarding {service} via {gateway} failed: {e}");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(NetworkError::Forward {
            service,
            attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Next hops for `service`, best first, each gateway once.
    fn candidates(
        &self,
        service: &str,
        link: Option<&str>,
        from: Option<&str>,
    ) -> Result<Vec<String>, NetworkError> {
        if let Some(name) = link {
            let gateway = self
                .inner
                .config
                .links
                .get(name)
                .ok_or_else(|| NetworkError::Config(format!("unknown link {name}")))?;
            return Ok(vec![gateway.clone()]);
        }

        let self_id = self.inner.router.node_id();
        let mut gateways: Vec<String> = Vec::new();
        for route in self.inner.router.lookup(service) {
            if route.gateway == self_id || Some(route.gateway.as_str()) == from {
                continue;
            }
            if !gateways.contains(&route.gateway) {
                gateways.push(route.gateway);
            }
        }
        if gateways.is_empty() {
            return Err(NetworkError::RouteNotFound {
                service: service.to_string(),
            });
        }
        Ok(gateways)
    }

    async fn forward(
        &self,
        gateway: &str,
        request: &Request,
        deadline: Instant,
    ) -> Result<Response, NetworkError> {
        let mut outgoing = request.clone();
        outgoing.hops += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        outgoing.deadline_ms = Some(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX));
        let payload = ProxyMessage::Request(outgoing).to_bytes()?;

        let mut session = match self.take_idle(gateway) {
            Some(session) => session,
            None => self.inner.tunnel.open(gateway, RPC_CHANNEL).await?,
        };
        if let Err(e) = session.send(&payload).await {
            // A parked session may have been closed by the peer meanwhile.
            if !matches!(e, TunnelError::SessionClosed { .. }) {
                return Err(e.into());
            }
            session = self.inner.tunnel.open(gateway, RPC_CHANNEL).await?;
            session.send(&payload).await?;
        }
        tracing::debug!(
            "Forwarded {}/{} to {gateway} (hop {})",
            request.service,
            request.endpoint,
            request.hops + 1
        );

        let reply = session.recv().await?;
        match ProxyMessage::from_bytes(&reply)? {
            ProxyMessage::Response(response) => {
                self.park(gateway, session);
                Ok(response)
            }
            ProxyMessage::Failure(failure) => {
                self.park(gateway, session);
                Err(failure.into_error(&request.service, gateway))
            }
            ProxyMessage::Request(_) => Err(NetworkError::Link {
                peer: gateway.to_string(),
                reason: "request received on a reply path".into(),
            }),
        }
    }

    /// The server half of one hop.
    async fn answer(&self, request: Request, from: &str) -> ProxyMessage {
        let service = request.service.clone();
        let limit = self.inner.config.request_timeout;
        let budget = request
            .deadline_ms
            .map(Duration::from_millis)
            .map_or(limit, |d| d.min(limit));
        let call = self.dispatch(request, deadline_after(budget), None, Some(from));
        let result = match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout {
                service: service.clone(),
            }),
        };
        match result {
            Ok(response) => ProxyMessage::Response(response),
            Err(e) => {
                tracing::debug!("Call to {service} from {from} failed here: {e}");
                ProxyMessage::Failure(Failure::from_error(&e))
            }
        }
    }

    fn take_idle(&self, gateway: &str) -> Option<Session> {
        let mut idle = lock(&self.inner.idle);
        let sessions = idle.get_mut(&(gateway.to_string(), RPC_CHANNEL.to_string()))?;
        while let Some(session) = sessions.pop() {
            if session.is_open() {
                return Some(session);
            }
        }
        None
    }

    /// Return a healthy session to the pool. Extra or evicted sessions are
    /// dropped, which closes them.
    fn park(&self, gateway: &str, session: Session) {
        if !session.is_open() {
            return;
        }
        let key = (gateway.to_string(), RPC_CHANNEL.to_string());
        let mut idle = lock(&self.inner.idle);
        if let Some(sessions) = idle.get_mut(&key) {
            if sessions.len() < IDLE_PER_PEER {
                sessions.push(session);
            }
            return;
        }
        idle.put(key, vec![session]);
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("node_id", &self.inner.router.node_id())
            .field("handlers", &lock(&self.inner.handlers).len())
            .finish()
    }
}

async fn serve_session(proxy: Proxy, mut session: Session, shutdown: CancellationToken) {
    let from = session.remote_node().to_string();
    loop {
        let bytes = tokio::select! {
            received = session.recv() => match received {
                Ok(bytes) => bytes,
                Err(_) => break,
            },
            _ = shutdown.cancelled() => break,
        };
        let request = match ProxyMessage::from_bytes(&bytes) {
            Ok(ProxyMessage::Request(request)) => request,
            Ok(_) => {
                tracing::warn!("Unexpected reply on an rpc session from {from}");
                break;
            }
            Err(e) => {
                tracing::warn!("Bad rpc message from {from}: {e}");
                break;
            }
        };

        let reply = match proxy.answer(request, &from).await.to_bytes() {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Could not encode reply to {from}: {e}");
                break;
            }
        };
        if let Err(e) = session.send(&reply).await {
            tracing::debug!("Reply to {from} not delivered: {e}");
            break;
        }
    }
}

/// `budget` from now, held to a far-off instant when it would overflow.
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}
