//! Routing table: service → routes keyed by identity.
//!
//! Pure data structure, no I/O and no clock of its own; callers pass `now`
//! so expiry is testable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Link id used for routes this node registered itself.
pub const LOCAL_LINK: &str = "local";

// ── Route ──────────────────────────────────────────────────────────────

/// A path to one instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub service: String,
    /// Where the service instance listens.
    pub address: String,
    /// Next-hop node id.
    pub gateway: String,
    /// Node id that originated the route.
    pub router: String,
    pub network: String,
    /// Local link the route was learned on. Never sent on the wire.
    #[serde(skip)]
    pub link: String,
    /// Hop count; 0 for local routes.
    pub metric: u32,
}

/// Identity of a route. Two entries never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub service: String,
    pub address: String,
    pub gateway: String,
    pub router: String,
    pub network: String,
}

impl Route {
    /// A route this node serves itself.
    pub fn local(
        service: impl Into<String>,
        address: impl Into<String>,
        node_id: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            service: service.into(),
            address: address.into(),
            gateway: node_id.clone(),
            router: node_id,
            network: network.into(),
            link: LOCAL_LINK.to_string(),
            metric: 0,
        }
    }

    pub fn key(&self) -> RouteKey {
        RouteKey {
            service: self.service.clone(),
            address: self.address.clone(),
            gateway: self.gateway.clone(),
            router: self.router.clone(),
            network: self.network.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.link == LOCAL_LINK
    }
}

impl RouteKey {
    /// Stable tie-breaker: first 8 bytes of SHA-256 over the identity.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        for part in [
            &self.service,
            &self.address,
            &self.gateway,
            &self.router,
            &self.network,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}

// ── Table ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    route: Route,
    /// Insertion recency; larger is fresher.
    stamp: u64,
    expires_at: Option<Instant>,
}

/// What an insert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    /// Same identity, different metric or link.
    Changed,
    /// Same identity and contents; only the expiry moved.
    Refreshed,
}

#[derive(Debug, Default, Clone)]
pub struct RoutingTable {
    services: HashMap<String, HashMap<RouteKey, Entry>>,
    next_stamp: u64,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a route. `ttl = None`, or one too large to represent
    /// as an instant, never expires.
    pub fn insert(&mut self, route: Route, ttl: Option<Duration>, now: Instant) -> InsertOutcome {
        let expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
        let key = route.key();
        self.next_stamp += 1;
        let stamp = self.next_stamp;

        let routes = self.services.entry(route.service.clone()).or_default();
        match routes.get_mut(&key) {
            Some(entry) if entry.route == route => {
                entry.expires_at = expires_at;
                InsertOutcome::Refreshed
            }
            Some(entry) => {
                *entry = Entry {
                    route,
                    stamp,
                    expires_at,
                };
                InsertOutcome::Changed
            }
            None => {
                routes.insert(
                    key,
                    Entry {
                        route,
                        stamp,
                        expires_at,
                    },
                );
                InsertOutcome::Added
            }
        }
    }

    /// Remove one identity. Absent identities are a no-op.
    pub fn delete(&mut self, key: &RouteKey) -> Option<Route> {
        let routes = self.services.get_mut(&key.service)?;
        let removed = routes.remove(key).map(|entry| entry.route);
        if routes.is_empty() {
            self.services.remove(&key.service);
        }
        removed
    }

    /// Remove every route matching `predicate`.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&Route) -> bool) -> Vec<Route> {
        let mut removed = Vec::new();
        self.services.retain(|_, routes| {
            routes.retain(|_, entry| {
                if predicate(&entry.route) {
                    removed.push(entry.route.clone());
                    false
                } else {
                    true
                }
            });
            !routes.is_empty()
        });
        removed
    }

    /// Remove every route learned on `link`.
    pub fn withdraw_link(&mut self, link: &str) -> Vec<Route> {
        self.remove_where(|route| route.link == link)
    }

    /// Remove expired routes.
    pub fn sweep(&mut self, now: Instant) -> Vec<Route> {
        let mut removed = Vec::new();
        self.services.retain(|_, routes| {
            routes.retain(|_, entry| match entry.expires_at {
                Some(at) if at <= now => {
                    removed.push(entry.route.clone());
                    false
                }
                _ => true,
            });
            !routes.is_empty()
        });
        removed
    }

    /// Routes for `service`: ascending metric, then freshest, then by hash.
    pub fn lookup(&self, service: &str) -> Vec<Route> {
        let Some(routes) = self.services.get(service) else {
            return Vec::new();
        };
        let mut entries: Vec<(&RouteKey, &Entry)> = routes.iter().collect();
        entries.sort_by(|(ka, a), (kb, b)| {
            a.route
                .metric
                .cmp(&b.route.metric)
                .then(b.stamp.cmp(&a.stamp))
                .then(ka.stable_hash().cmp(&kb.stable_hash()))
        });
        entries.into_iter().map(|(_, e)| e.route.clone()).collect()
    }

    pub fn get(&self, key: &RouteKey) -> Option<&Route> {
        self.services.get(&key.service)?.get(key).map(|e| &e.route)
    }

    /// Service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every route, grouped by service in lookup order.
    pub fn routes(&self) -> Vec<Route> {
        self.services()
            .iter()
            .flat_map(|service| self.lookup(service))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
