//! Route advertisements: wire format, sequence tracking, and per-link
//! selection/diffing.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::table::{Route, RouteKey, RoutingTable};
use crate::config::AdvertiseStrategy;
use crate::NetworkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvertType {
    Create,
    Update,
    Delete,
}

/// A batch of route changes from one origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advert {
    /// Node id of the sender.
    pub origin: String,
    /// Monotonic per origin; older or repeated sequences are dropped.
    pub sequence: u64,
    pub operation: AdvertType,
    pub routes: Vec<Route>,
    /// Lifetime of the advertised routes at the receiver.
    pub ttl: Duration,
}

impl Advert {
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Result of applying an advert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertOutcome {
    /// Accepted; `changed` routes were added, modified or removed.
    Applied { changed: usize },
    /// Sequence not newer than the last one seen from this origin.
    Stale,
}

// ── Sequences ──────────────────────────────────────────────────────────

/// First sequence for a fresh process. Time-seeded so a restarted node's
/// adverts are never mistaken for stale ones.
pub(crate) fn initial_sequence() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(1)
}

/// Last sequence seen per origin.
#[derive(Debug, Default)]
pub(crate) struct SequenceTracker {
    last: HashMap<String, u64>,
}

impl SequenceTracker {
    /// Record `sequence` if it is newer than anything seen from `origin`.
    pub(crate) fn accept(&mut self, origin: &str, sequence: u64) -> bool {
        match self.last.get_mut(origin) {
            Some(last) if sequence <= *last => false,
            Some(last) => {
                *last = sequence;
                true
            }
            None => {
                self.last.insert(origin.to_string(), sequence);
                true
            }
        }
    }

    pub(crate) fn forget(&mut self, origin: &str) {
        self.last.remove(origin);
    }
}

// ── Selection ──────────────────────────────────────────────────────────

/// Routes `strategy` allows onto `link` (to node `peer`), keyed by the
/// identity the receiver will store them under.
///
/// Split horizon: nothing learned on `link` and nothing `peer` originated.
/// Each (service, address, router, network) is offered once, with its best
/// metric, because the receiver rewrites the gateway to us.
pub(crate) fn select(
    table: &RoutingTable,
    strategy: AdvertiseStrategy,
    self_id: &str,
    link: &str,
    peer: &str,
) -> HashMap<RouteKey, Route> {
    let eligible = |route: &Route| route.link != link && route.router != peer;

    let picked: Vec<Route> = match strategy {
        AdvertiseStrategy::None => Vec::new(),
        AdvertiseStrategy::Local => table
            .routes()
            .into_iter()
            .filter(|r| r.router == self_id && eligible(r))
            .collect(),
        AdvertiseStrategy::All => table.routes().into_iter().filter(|r| eligible(r)).collect(),
        AdvertiseStrategy::Best => table
            .services()
            .iter()
            .filter_map(|service| table.lookup(service).into_iter().next())
            .filter(|r| eligible(r))
            .collect(),
    };

    let mut selection: HashMap<RouteKey, Route> = HashMap::new();
    for mut route in picked {
        route.gateway = self_id.to_string();
        let key = route.key();
        match selection.get(&key) {
            Some(existing) if existing.metric <= route.metric => {}
            _ => {
                selection.insert(key, route);
            }
        }
    }
    selection
}

/// Changes between what a link was last told and the current selection.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct LinkDiff {
    pub creates: Vec<Route>,
    pub updates: Vec<Route>,
    pub deletes: Vec<Route>,
}

impl LinkDiff {
    pub(crate) fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Diff `selection` against `advertised` and make `advertised` match it.
///
/// With `refresh`, everything still selected is re-sent as an update.
pub(crate) fn diff(
    advertised: &mut HashMap<RouteKey, Route>,
    selection: HashMap<RouteKey, Route>,
    refresh: bool,
) -> LinkDiff {
    let mut out = LinkDiff::default();

    let gone: Vec<RouteKey> = advertised
        .keys()
        .filter(|key| !selection.contains_key(*key))
        .cloned()
        .collect();
    for key in gone {
        if let Some(route) = advertised.remove(&key) {
            out.deletes.push(route);
        }
    }

    for (key, route) in selection {
        match advertised.get(&key) {
            None => out.creates.push(route.clone()),
            Some(previous) if previous.metric != route.metric || refresh => {
                out.updates.push(route.clone())
            }
            Some(_) => continue,
        }
        advertised.insert(key, route);
    }

    for list in [&mut out.creates, &mut out.updates, &mut out.deletes] {
        list.sort_by(|a, b| a.key().cmp(&b.key()));
    }
    out
}
