//! Per-component configuration with documented defaults.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_tunnel::BackoffConfig;

use crate::registry::Registry;
use crate::resolver::Resolver;
use crate::NetworkError;

/// Default overlay network name.
pub const DEFAULT_NETWORK: &str = "weft";

/// Default bind address.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:8085";

// ── Advertise strategy ──────────────────────────────────────────────────

/// Which routes a node advertises to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AdvertiseStrategy {
    /// Every route except those learned on the target link.
    All,
    /// Per service, the single best route.
    Best,
    /// Only routes this node originates.
    #[default]
    Local,
    /// Never advertise.
    None,
}

impl fmt::Display for AdvertiseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdvertiseStrategy::All => "all",
            AdvertiseStrategy::Best => "best",
            AdvertiseStrategy::Local => "local",
            AdvertiseStrategy::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for AdvertiseStrategy {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(AdvertiseStrategy::All),
            "best" => Ok(AdvertiseStrategy::Best),
            "local" => Ok(AdvertiseStrategy::Local),
            "none" => Ok(AdvertiseStrategy::None),
            other => Err(NetworkError::Config(format!(
                "unknown advertise strategy {other:?} (expected all, best, local or none)"
            ))),
        }
    }
}

// ── Router ──────────────────────────────────────────────────────────────

/// Configuration for the [`Router`](crate::Router).
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Local node id; routes we originate carry it as router and gateway.
    pub(crate) node_id: String,
    /// Overlay network name; routes from other networks are ignored.
    pub(crate) network: String,
    pub(crate) strategy: AdvertiseStrategy,
    /// Full re-advertisement period.
    pub(crate) advert_interval: Duration,
    /// Lifetime given to routes we advertise.
    pub(crate) route_ttl: Duration,
    /// Ceiling on the lifetime a peer may give the routes it advertises.
    pub(crate) max_route_ttl: Duration,
    /// How often expired routes are swept.
    pub(crate) sweep_interval: Duration,
    /// Learned routes at or above this metric are dropped.
    pub(crate) max_metric: u32,
    /// Per-link outbound advert queue depth.
    pub(crate) link_queue: usize,
}

impl RouterConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            network: DEFAULT_NETWORK.to_string(),
            strategy: AdvertiseStrategy::default(),
            advert_interval: Duration::from_secs(15),
            route_ttl: Duration::from_secs(60),
            max_route_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(5),
            max_metric: 16,
            link_queue: 64,
        }
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn strategy(mut self, strategy: AdvertiseStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn advert_interval(mut self, interval: Duration) -> Self {
        self.advert_interval = interval;
        self
    }

    pub fn route_ttl(mut self, ttl: Duration) -> Self {
        self.route_ttl = ttl;
        self
    }

    pub fn max_route_ttl(mut self, ttl: Duration) -> Self {
        self.max_route_ttl = ttl;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn max_metric(mut self, max: u32) -> Self {
        self.max_metric = max;
        self
    }

    pub fn link_queue(mut self, capacity: usize) -> Self {
        self.link_queue = capacity;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), NetworkError> {
        if self.node_id.trim().is_empty() {
            return Err(NetworkError::Config("router node id must not be empty".into()));
        }
        if self.network.trim().is_empty() {
            return Err(NetworkError::Config("network name must not be empty".into()));
        }
        if self.advert_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(NetworkError::Config("router intervals must be positive".into()));
        }
        if self.route_ttl <= self.advert_interval {
            return Err(NetworkError::Config(format!(
                "route ttl {:?} must exceed the advert interval {:?}",
                self.route_ttl, self.advert_interval
            )));
        }
        if self.max_route_ttl < self.route_ttl {
            return Err(NetworkError::Config(format!(
                "max route ttl {:?} must not be below the route ttl {:?}",
                self.max_route_ttl, self.route_ttl
            )));
        }
        if self.max_metric < 2 {
            return Err(NetworkError::Config("max metric must be at least 2".into()));
        }
        if self.link_queue == 0 {
            return Err(NetworkError::Config("link queue must be non-zero".into()));
        }
        Ok(())
    }
}

// ── Node ────────────────────────────────────────────────────────────────

/// Configuration for a [`Node`](crate::Node).
#[derive(Clone)]
pub struct NodeConfig {
    /// Address the tunnel listens on.
    pub(crate) address: String,
    /// Address announced to peers, if different from the bound one.
    pub(crate) advertise: Option<String>,
    pub(crate) network: String,
    /// Static peers dialled on connect, in addition to resolved ones.
    pub(crate) nodes: Vec<String>,
    pub(crate) keepalive_interval: Duration,
    /// Consecutive misses before a link is declared disconnected.
    pub(crate) max_missed_keepalives: u32,
    /// Re-resolution period, also used to retry when isolated.
    pub(crate) resolve_interval: Duration,
    /// Redial policy for outbound links.
    pub(crate) link_backoff: BackoffConfig,
    /// Time link tasks get to flush final adverts on close.
    pub(crate) shutdown_grace: Duration,
    /// Hard limit for `close()`.
    pub(crate) shutdown_timeout: Duration,
    /// Inbound data-session backlog handed to the proxy.
    pub(crate) data_session_buffer: usize,
    /// Bootstrap discovery, in addition to `nodes`.
    pub(crate) resolver: Option<Resolver>,
    /// Source of local routes.
    pub(crate) registry: Option<Arc<dyn Registry>>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            advertise: None,
            network: DEFAULT_NETWORK.to_string(),
            nodes: Vec::new(),
            keepalive_interval: Duration::from_secs(5),
            max_missed_keepalives: 3,
            resolve_interval: Duration::from_secs(30),
            link_backoff: BackoffConfig::default(),
            shutdown_grace: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            data_session_buffer: 128,
            resolver: None,
            registry: None,
        }
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("address", &self.address)
            .field("advertise", &self.advertise)
            .field("network", &self.network)
            .field("nodes", &self.nodes)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("max_missed_keepalives", &self.max_missed_keepalives)
            .field("resolve_interval", &self.resolve_interval)
            .field("link_backoff", &self.link_backoff)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("resolver", &self.resolver)
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn advertise(mut self, address: impl Into<String>) -> Self {
        self.advertise = Some(address.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn keepalive(mut self, interval: Duration, max_missed: u32) -> Self {
        self.keepalive_interval = interval;
        self.max_missed_keepalives = max_missed;
        self
    }

    pub fn resolve_interval(mut self, interval: Duration) -> Self {
        self.resolve_interval = interval;
        self
    }

    pub fn link_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.link_backoff = backoff;
        self
    }

    pub fn shutdown(mut self, grace: Duration, timeout: Duration) -> Self {
        self.shutdown_grace = grace;
        self.shutdown_timeout = timeout;
        self
    }

    pub fn data_session_buffer(mut self, capacity: usize) -> Self {
        self.data_session_buffer = capacity;
        self
    }

    pub fn resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), NetworkError> {
        if self.address.trim().is_empty() {
            return Err(NetworkError::Config("bind address must not be empty".into()));
        }
        if self.network.trim().is_empty() {
            return Err(NetworkError::Config("network name must not be empty".into()));
        }
        if self.keepalive_interval.is_zero() || self.resolve_interval.is_zero() {
            return Err(NetworkError::Config("node intervals must be positive".into()));
        }
        if self.max_missed_keepalives == 0 {
            return Err(NetworkError::Config("max missed keepalives must be >= 1".into()));
        }
        if self.shutdown_timeout < self.shutdown_grace {
            return Err(NetworkError::Config(
                "shutdown timeout must not be shorter than the grace period".into(),
            ));
        }
        if self.data_session_buffer == 0 {
            return Err(NetworkError::Config("data session buffer must be non-zero".into()));
        }
        Ok(())
    }
}

// ── Proxy ───────────────────────────────────────────────────────────────

/// Configuration for the [`Proxy`](crate::Proxy).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Route candidates tried per call.
    pub(crate) max_attempts: usize,
    /// Idle sessions kept per (node, channel), across this many keys.
    pub(crate) session_cache: usize,
    /// Forwarding depth after which a call is refused.
    pub(crate) max_hops: u32,
    /// Default deadline when the caller gives none.
    pub(crate) request_timeout: Duration,
    /// Named links: name → gateway node id.
    pub(crate) links: HashMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            session_cache: 64,
            max_hops: 8,
            request_timeout: Duration::from_secs(30),
            links: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn session_cache(mut self, capacity: usize) -> Self {
        self.session_cache = capacity;
        self
    }

    pub fn max_hops(mut self, hops: u32) -> Self {
        self.max_hops = hops;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Pin calls made with `link = name` to `gateway`.
    pub fn link(mut self, name: impl Into<String>, gateway: impl Into<String>) -> Self {
        self.links.insert(name.into(), gateway.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), NetworkError> {
        if self.max_attempts == 0 {
            return Err(NetworkError::Config("proxy max attempts must be >= 1".into()));
        }
        if self.session_cache == 0 {
            return Err(NetworkError::Config("proxy session cache must be non-zero".into()));
        }
        if self.max_hops == 0 {
            return Err(NetworkError::Config("proxy max hops must be >= 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(NetworkError::Config("proxy request timeout must be positive".into()));
        }
        Ok(())
    }
}
