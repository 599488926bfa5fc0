//! Router: owns the routing table, applies adverts from peers, and feeds
//! per-link advert queues.
//!
//! All mutation happens under one short-lived mutex. Lookups read an
//! immutable snapshot published on a `watch` channel after every change, so
//! they never wait on advert processing.

mod advert;
mod table;

pub use advert::{Advert, AdvertOutcome, AdvertType};
pub use table::{InsertOutcome, Route, RouteKey, RoutingTable, LOCAL_LINK};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{AdvertiseStrategy, RouterConfig};
use crate::registry::{Registry, RegistryEvent};
use crate::NetworkError;
use advert::{LinkDiff, SequenceTracker};

/// Read-only view of the table as of the last change.
#[derive(Debug, Default)]
pub struct TableSnapshot {
    /// Per service, in lookup order.
    services: HashMap<String, Vec<Route>>,
    len: usize,
}

impl TableSnapshot {
    fn from_table(table: &RoutingTable) -> Self {
        let services: HashMap<String, Vec<Route>> = table
            .services()
            .into_iter()
            .map(|service| {
                let routes = table.lookup(&service);
                (service, routes)
            })
            .collect();
        Self {
            services,
            len: table.len(),
        }
    }

    pub fn lookup(&self, service: &str) -> &[Route] {
        self.services.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct LinkEntry {
    peer: String,
    queue: mpsc::Sender<Advert>,
    /// What this link was last told, keyed by receiver-side identity.
    advertised: HashMap<RouteKey, Route>,
}

struct RouterState {
    table: RoutingTable,
    sequence: u64,
    seen: SequenceTracker,
    links: HashMap<String, LinkEntry>,
}

struct RouterInner {
    config: RouterConfig,
    state: Mutex<RouterState>,
    snapshot: watch::Sender<Arc<TableSnapshot>>,
}

/// Handle to the routing table. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

/// Adverts computed under the lock, sent after it is released.
type Outbox = Vec<(mpsc::Sender<Advert>, String, Advert)>;

impl Router {
    pub fn new(config: RouterConfig) -> Result<Self, NetworkError> {
        config.validate()?;
        let (snapshot, _) = watch::channel(Arc::new(TableSnapshot::default()));
        Ok(Self {
            inner: Arc::new(RouterInner {
                config,
                state: Mutex::new(RouterState {
                    table: RoutingTable::new(),
                    sequence: advert::initial_sequence(),
                    seen: SequenceTracker::default(),
                    links: HashMap::new(),
                }),
                snapshot,
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn network(&self) -> &str {
        &self.inner.config.network
    }

    /// Advertise strategy, fixed at construction.
    pub fn strategy(&self) -> AdvertiseStrategy {
        self.inner.config.strategy
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// Routes for `service`, best first. Empty when nothing matches.
    pub fn lookup(&self, service: &str) -> Vec<Route> {
        self.inner.snapshot.borrow().lookup(service).to_vec()
    }

    /// Every route, grouped by service.
    pub fn table(&self) -> Vec<Route> {
        self.state().table.routes()
    }

    /// Known service names, sorted.
    pub fn services(&self) -> Vec<String> {
        self.state().table.services()
    }

    /// Follow table changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TableSnapshot>> {
        self.inner.snapshot.subscribe()
    }

    /// Links currently attached, sorted.
    pub fn links(&self) -> Vec<String> {
        let mut links: Vec<String> = self.state().links.keys().cloned().collect();
        links.sort();
        links
    }

    // ── Local routes ───────────────────────────────────────────────────

    /// Register a route this node serves. Returns false if already present.
    pub fn add_local_route(&self, service: &str, address: &str) -> bool {
        let route = Route::local(service, address, self.node_id(), self.network());
        let outbox = {
            let mut state = self.state();
            if state.table.insert(route, None, Instant::now()) == InsertOutcome::Refreshed {
                return false;
            }
            self.publish(&state);
            self.advertise_changes(&mut state, false)
        };
        tracing::info!("Registered local route {service} at {address}");
        self.flush(outbox);
        true
    }

    /// Drop a local route and tell every link. Returns false if absent.
    pub fn remove_local_route(&self, service: &str, address: &str) -> bool {
        let key = Route::local(service, address, self.node_id(), self.network()).key();
        let outbox = {
            let mut state = self.state();
            if state.table.delete(&key).is_none() {
                return false;
            }
            self.publish(&state);
            self.advertise_changes(&mut state, false)
        };
        tracing::info!("Removed local route {service} at {address}");
        self.flush(outbox);
        true
    }

    /// Remove every local route (final Delete adverts on shutdown).
    pub fn withdraw_local(&self) -> usize {
        let (removed, outbox) = {
            let mut state = self.state();
            let removed = state.table.remove_where(Route::is_local);
            if removed.is_empty() {
                return 0;
            }
            self.publish(&state);
            (removed.len(), self.advertise_changes(&mut state, false))
        };
        self.flush(outbox);
        removed
    }

    // ── Adverts ────────────────────────────────────────────────────────

    /// Apply an advert received on `link`.
    pub fn on_advert(&self, link: &str, advert: Advert) -> AdvertOutcome {
        let now = Instant::now();
        let config = &self.inner.config;
        let (changed, outbox) = {
            let mut state = self.state();
            if !state.seen.accept(&advert.origin, advert.sequence) {
                tracing::debug!(
                    "Dropping stale advert {} from {} on {link}",
                    advert.sequence,
                    advert.origin
                );
                return AdvertOutcome::Stale;
            }

            let ttl = advert.ttl.min(config.max_route_ttl);
            let mut changed = 0;
            for mut route in advert.routes {
                if route.router == config.node_id || route.network != config.network {
                    continue;
                }
                route.gateway = advert.origin.clone();
                route.link = link.to_string();
                match advert.operation {
                    AdvertType::Create | AdvertType::Update => {
                        route.metric = route.metric.saturating_add(1);
                        if route.metric >= config.max_metric {
                            // Too far; whatever we held for it is no longer valid.
                            if state.table.delete(&route.key()).is_some() {
                                changed += 1;
                            }
                            continue;
                        }
                        if state.table.insert(route, Some(ttl), now)
                            != InsertOutcome::Refreshed
                        {
                            changed += 1;
                        }
                    }
                    AdvertType::Delete => {
                        if state.table.delete(&route.key()).is_some() {
                            changed += 1;
                        }
                    }
                }
            }

            if changed == 0 {
                return AdvertOutcome::Applied { changed };
            }
            self.publish(&state);
            (changed, self.advertise_changes(&mut state, false))
        };
        tracing::debug!("Applied advert from {} on {link}: {changed} change(s)", advert.origin);
        self.flush(outbox);
        AdvertOutcome::Applied { changed }
    }

    /// Attach a link to `peer` and get the queue of adverts to send on it.
    /// The current selection is queued right away.
    pub fn add_link(&self, link: &str, peer: &str) -> mpsc::Receiver<Advert> {
        let (tx, rx) = mpsc::channel(self.inner.config.link_queue);
        let outbox = {
            let mut state = self.state();
            state.links.insert(
                link.to_string(),
                LinkEntry {
                    peer: peer.to_string(),
                    queue: tx,
                    advertised: HashMap::new(),
                },
            );
            self.advertise_changes(&mut state, false)
        };
        tracing::debug!("Router attached link {link} to {peer}");
        self.flush(outbox);
        rx
    }

    /// Detach a link and withdraw everything learned on it.
    pub fn remove_link(&self, link: &str) -> Vec<Route> {
        let (removed, outbox) = {
            let mut state = self.state();
            let Some(entry) = state.links.remove(link) else {
                return Vec::new();
            };
            state.seen.forget(&entry.peer);
            self.withdraw_locked(&mut state, link)
        };
        self.flush(outbox);
        removed
    }

    /// Remove every route learned on `link` (implicit Delete), keeping the
    /// link attached.
    pub fn withdraw_link(&self, link: &str) -> Vec<Route> {
        let (removed, outbox) = {
            let mut state = self.state();
            self.withdraw_locked(&mut state, link)
        };
        self.flush(outbox);
        removed
    }

    fn withdraw_locked(&self, state: &mut RouterState, link: &str) -> (Vec<Route>, Outbox) {
        let removed = state.table.withdraw_link(link);
        if removed.is_empty() {
            return (removed, Vec::new());
        }
        tracing::info!("Withdrew {} route(s) learned on {link}", removed.len());
        self.publish(state);
        let outbox = self.advertise_changes(state, false);
        (removed, outbox)
    }

    /// Periodic round: re-send every link its full selection.
    pub fn advertise(&self) {
        let outbox = {
            let mut state = self.state();
            self.advertise_changes(&mut state, true)
        };
        self.flush(outbox);
    }

    /// Drop expired routes.
    pub fn sweep(&self) -> Vec<Route> {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> Vec<Route> {
        let (removed, outbox) = {
            let mut state = self.state();
            let removed = state.table.sweep(now);
            if removed.is_empty() {
                return removed;
            }
            self.publish(&state);
            (removed, self.advertise_changes(&mut state, false))
        };
        tracing::debug!("Swept {} expired route(s)", removed.len());
        self.flush(outbox);
        removed
    }

    // ── Background ─────────────────────────────────────────────────────

    /// Load the registry, then follow its watch stream and run the periodic
    /// advert and sweep timers until `shutdown`.
    pub async fn start(
        &self,
        registry: Option<Arc<dyn Registry>>,
        shutdown: CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<(), NetworkError> {
        if let Some(registry) = registry {
            // Subscribe first so nothing registered in between is missed.
            let events = registry.watch(None).await?;
            for instance in registry.list_services().await? {
                self.add_local_route(&instance.name, &instance.address);
            }
            tasks.spawn(watch_registry(self.clone(), events, shutdown.clone()));
        }
        tasks.spawn(timers(self.clone(), shutdown));
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &RouterState) {
        self.inner
            .snapshot
            .send_replace(Arc::new(TableSnapshot::from_table(&state.table)));
    }

    /// Diff every link against the current table and build its adverts.
    fn advertise_changes(&self, state: &mut RouterState, refresh: bool) -> Outbox {
        let config = &self.inner.config;
        let mut outbox = Vec::new();
        if config.strategy == AdvertiseStrategy::None {
            return outbox;
        }

        let RouterState {
            table,
            sequence,
            links,
            ..
        } = state;
        for (link, entry) in links.iter_mut() {
            let selection =
                advert::select(table, config.strategy, &config.node_id, link, &entry.peer);
            let LinkDiff {
                creates,
                updates,
                deletes,
            } = advert::diff(&mut entry.advertised, selection, refresh);

            for (operation, routes) in [
                (AdvertType::Delete, deletes),
                (AdvertType::Create, creates),
                (AdvertType::Update, updates),
            ] {
                if routes.is_empty() {
                    continue;
                }
                *sequence += 1;
                outbox.push((
                    entry.queue.clone(),
                    link.clone(),
                    Advert {
                        origin: config.node_id.clone(),
                        sequence: *sequence,
                        operation,
                        routes,
                        ttl: config.route_ttl,
                    },
                ));
            }
        }
        outbox
    }

    fn flush(&self, outbox: Outbox) {
        for (queue, link, advert) in outbox {
            if let Err(e) = queue.try_send(advert) {
                tracing::warn!("Advert queue for {link} rejected an advert: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("node_id", &self.node_id())
            .field("strategy", &self.strategy())
            .field("routes", &self.inner.snapshot.borrow().len())
            .finish()
    }
}

async fn watch_registry(
    router: Router,
    mut events: mpsc::Receiver<RegistryEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    tracing::warn!("Registry watch stream ended");
                    break;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        match event {
            RegistryEvent::Added(instance) => {
                router.add_local_route(&instance.name, &instance.address);
            }
            RegistryEvent::Removed(instance) => {
                router.remove_local_route(&instance.name, &instance.address);
            }
        }
    }
}

async fn timers(router: Router, shutdown: CancellationToken) {
    let config = &router.inner.config;
    let mut advert_tick = tokio::time::interval(config.advert_interval);
    let mut sweep_tick = tokio::time::interval(config.sweep_interval);
    // Skip the immediate first ticks
    advert_tick.tick().await;
    sweep_tick.tick().await;

    loop {
        tokio::select! {
            _ = advert_tick.tick() => router.advertise(),
            _ = sweep_tick.tick() => {
                router.sweep();
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn router(id: &str, strategy: AdvertiseStrategy) -> Router {
        Router::new(RouterConfig::new(id).strategy(strategy)).unwrap()
    }

    fn learned(service: &str, router: &str, metric: u32) -> Route {
        Route {
            service: service.into(),
            address: format!("{service}.svc:1"),
            gateway: router.into(),
            router: router.into(),
            network: "weft".into(),
            link: String::new(),
            metric,
        }
    }

    fn advert(origin: &str, sequence: u64, operation: AdvertType, routes: Vec<Route>) -> Advert {
        Advert {
            origin: origin.into(),
            sequence,
            operation,
            routes,
            ttl: Duration::from_secs(60),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Advert>) -> Vec<Advert> {
        let mut out = Vec::new();
        while let Ok(a) = rx.try_recv() {
            out.push(a);
        }
        out
    }

    #[test]
    fn local_route_is_metric_zero_self_gateway() {
        let r = router("a1", AdvertiseStrategy::Local);
        assert!(r.add_local_route("echo", "10.0.0.1:9000"));
        assert!(!r.add_local_route("echo", "10.0.0.1:9000"));

        let routes = r.lookup("echo");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].metric, 0);
        assert_eq!(routes[0].gateway, "a1");
        assert_eq!(routes[0].router, "a1");
        assert_eq!(routes[0].link, LOCAL_LINK);
    }

    #[test]
    fn learned_route_gets_metric_plus_one() {
        let r = router("b1", AdvertiseStrategy::Local);
        let outcome = r.on_advert(
            "a1",
            advert("a1", 1, AdvertType::Create, vec![learned("echo", "a1", 0)]),
        );
        assert_eq!(outcome, AdvertOutcome::Applied { changed: 1 });
        let routes = r.lookup("echo");
        assert_eq!(routes[0].metric, 1);
        assert_eq!(routes[0].gateway, "a1");
        assert_eq!(routes[0].link, "a1");
    }

    #[test]
    fn stale_sequences_dropped() {
        let r = router("b1", AdvertiseStrategy::Local);
        let a = advert("a1", 5, AdvertType::Create, vec![learned("echo", "a1", 0)]);
        r.on_advert("a1", a.clone());
        assert_eq!(r.on_advert("a1", a), AdvertOutcome::Stale);
        let older = advert("a1", 4, AdvertType::Delete, vec![learned("echo", "a1", 0)]);
        assert_eq!(r.on_advert("a1", older), AdvertOutcome::Stale);
        assert_eq!(r.lookup("echo").len(), 1);
    }

    #[test]
    fn delete_advert_removes_route() {
        let r = router("b1", AdvertiseStrategy::Local);
        r.on_advert("a1", advert("a1", 1, AdvertType::Create, vec![learned("echo", "a1", 0)]));
        r.on_advert("a1", advert("a1", 2, AdvertType::Delete, vec![learned("echo", "a1", 0)]));
        assert!(r.lookup("echo").is_empty());
    }

    #[test]
    fn own_and_foreign_network_routes_ignored() {
        let r = router("b1", AdvertiseStrategy::Local);
        let mut foreign = learned("kv", "a1", 0);
        foreign.network = "other".into();
        let outcome = r.on_advert(
            "a1",
            advert("a1", 1, AdvertType::Create, vec![learned("echo", "b1", 0), foreign]),
        );
        assert_eq!(outcome, AdvertOutcome::Applied { changed: 0 });
        assert!(r.table().is_empty());
    }

    #[test]
    fn max_metric_caps_learning() {
        let r = Router::new(RouterConfig::new("b1").max_metric(4)).unwrap();
        r.on_advert("a1", advert("a1", 1, AdvertType::Create, vec![learned("echo", "x1", 3)]));
        assert!(r.lookup("echo").is_empty());
        r.on_advert("a1", advert("a1", 2, AdvertType::Create, vec![learned("echo", "x1", 2)]));
        assert_eq!(r.lookup("echo")[0].metric, 3);
    }

    #[test]
    fn new_link_receives_current_selection() {
        let r = router("a1", AdvertiseStrategy::Local);
        r.add_local_route("echo", "10.0.0.1:9000");
        let mut rx = r.add_link("b1", "b1");

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation, AdvertType::Create);
        assert_eq!(sent[0].origin, "a1");
        assert_eq!(sent[0].routes.len(), 1);
    }

    #[test]
    fn local_removal_sends_delete() {
        let r = router("a1", AdvertiseStrategy::Local);
        r.add_local_route("echo", "10.0.0.1:9000");
        let mut rx = r.add_link("b1", "b1");
        drain(&mut rx);

        assert!(r.remove_local_route("echo", "10.0.0.1:9000"));
        assert!(!r.remove_local_route("echo", "10.0.0.1:9000"));
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation, AdvertType::Delete);
    }

    #[test]
    fn sequences_increase_across_adverts() {
        let r = router("a1", AdvertiseStrategy::Local);
        let mut rx = r.add_link("b1", "b1");
        r.add_local_route("echo", "10.0.0.1:9000");
        r.add_local_route("kv", "10.0.0.1:9001");
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent[1].sequence > sent[0].sequence);
    }

    #[test]
    fn periodic_round_refreshes_as_update() {
        let r = router("a1", AdvertiseStrategy::Local);
        r.add_local_route("echo", "10.0.0.1:9000");
        let mut rx = r.add_link("b1", "b1");
        drain(&mut rx);

        r.advertise();
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation, AdvertType::Update);
    }

    #[test]
    fn none_strategy_sends_nothing() {
        let r = router("a1", AdvertiseStrategy::None);
        r.add_local_route("echo", "10.0.0.1:9000");
        let mut rx = r.add_link("b1", "b1");
        r.advertise();
        r.remove_local_route("echo", "10.0.0.1:9000");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn all_strategy_relays_but_not_back() {
        let r = router("b1", AdvertiseStrategy::All);
        let mut to_a = r.add_link("a1", "a1");
        let mut to_c = r.add_link("c1", "c1");

        r.on_advert("a1", advert("a1", 1, AdvertType::Create, vec![learned("echo", "a1", 0)]));

        assert!(drain(&mut to_a).is_empty());
        let relayed = drain(&mut to_c);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].routes[0].router, "a1");
        assert_eq!(relayed[0].routes[0].gateway, "b1");
        assert_eq!(relayed[0].routes[0].metric, 1);
    }

    #[test]
    fn removing_link_withdraws_and_propagates() {
        let r = router("b1", AdvertiseStrategy::All);
        let _to_a = r.add_link("a1", "a1");
        let mut to_c = r.add_link("c1", "c1");
        r.on_advert("a1", advert("a1", 1, AdvertType::Create, vec![learned("echo", "a1", 0)]));
        drain(&mut to_c);

        let removed = r.remove_link("a1");
        assert_eq!(removed.len(), 1);
        assert!(r.lookup("echo").is_empty());
        let sent = drain(&mut to_c);
        assert_eq!(sent[0].operation, AdvertType::Delete);

        // The origin's sequence is forgotten with the link.
        let _to_a = r.add_link("a1", "a1");
        let outcome =
            r.on_advert("a1", advert("a1", 1, AdvertType::Create, vec![learned("echo", "a1", 0)]));
        assert_eq!(outcome, AdvertOutcome::Applied { changed: 1 });
    }

    #[test]
    fn sweep_expires_learned_routes() {
        let r = router("b1", AdvertiseStrategy::Local);
        r.add_local_route("kv", "10.0.0.2:1");
        r.on_advert("a1", advert("a1", 1, AdvertType::Create, vec![learned("echo", "a1", 0)]));

        assert!(r.sweep().is_empty());
        let removed = r.sweep_at(Instant::now() + Duration::from_secs(61));
        assert_eq!(removed.len(), 1);
        assert!(r.lookup("echo").is_empty());
        assert_eq!(r.lookup("kv").len(), 1);
    }

    #[test]
    fn huge_advertised_ttl_is_capped() {
        let r = router("b1", AdvertiseStrategy::Local);
        let mut sent = advert("a1", 1, AdvertType::Create, vec![learned("echo", "a1", 0)]);
        sent.ttl = Duration::from_secs(u64::MAX);
        let received = Advert::from_bytes(&sent.to_bytes().unwrap()).unwrap();
        assert_eq!(received.ttl, Duration::from_secs(u64::MAX));

        let outcome = r.on_advert("link-a", received);
        assert_eq!(outcome, AdvertOutcome::Applied { changed: 1 });
        assert_eq!(r.lookup("echo").len(), 1);

        // Held for max_route_ttl (600s by default), not forever
        assert!(r.sweep_at(Instant::now() + Duration::from_secs(599)).is_empty());
        let removed = r.sweep_at(Instant::now() + Duration::from_secs(601));
        assert_eq!(removed.len(), 1);
        assert!(r.lookup("echo").is_empty());
    }

    #[test]
    fn withdraw_local_clears_own_routes() {
        let r = router("a1", AdvertiseStrategy::Local);
        r.add_local_route("echo", "10.0.0.1:9000");
        r.add_local_route("kv", "10.0.0.1:9001");
        let mut rx = r.add_link("b1", "b1");
        drain(&mut rx);

        assert_eq!(r.withdraw_local(), 2);
        assert!(r.table().is_empty());
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation, AdvertType::Delete);
        assert_eq!(sent[0].routes.len(), 2);
    }

    #[tokio::test]
    async fn start_loads_and_follows_registry() {
        use crate::registry::{MemoryRegistry, ServiceInstance};

        let r = router("a1", AdvertiseStrategy::Local);
        let registry = MemoryRegistry::new();
        registry.register(ServiceInstance::new("echo", "10.0.0.1:9000"));

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        r.start(Some(Arc::new(registry.clone())), shutdown.clone(), &tasks)
            .await
            .unwrap();
        assert_eq!(r.lookup("echo").len(), 1);

        let mut changes = r.subscribe();
        registry.register(ServiceInstance::new("kv", "10.0.0.1:9001"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while r.lookup("kv").is_empty() {
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("registry add not applied");

        registry.deregister("echo", "10.0.0.1:9000");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !r.lookup("echo").is_empty() {
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("registry remove not applied");

        shutdown.cancel();
        tasks.close();
        tasks.wait().await;
    }
}
