//! Link liveness: a pure state machine, no I/O.
//!
//! A link moves Connecting → Established → Advertising, drops to Degraded
//! when keepalives go missing and back to Advertising on the next message.
//! After `max_missed` consecutive misses it is Disconnected. Closed is
//! terminal and only reached through an explicit close.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Established,
    Advertising,
    Degraded,
    Closed,
}

impl LinkState {
    /// Still carrying control traffic.
    pub fn is_up(self) -> bool {
        matches!(
            self,
            LinkState::Established | LinkState::Advertising | LinkState::Degraded
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Established => "established",
            LinkState::Advertising => "advertising",
            LinkState::Degraded => "degraded",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub id: String,
    /// Remote node id.
    pub node_id: String,
    /// Address the peer announced in its Hello.
    pub address: String,
    pub state: LinkState,
    /// We dialled this link.
    pub outbound: bool,
    pub missed_keepalives: u32,
    /// Time since the peer was last heard from.
    pub idle: Duration,
}

/// Keepalive accounting for one link.
#[derive(Debug, Clone)]
pub(crate) struct LinkHealth {
    state: LinkState,
    last_seen: Instant,
    missed: u32,
    interval: Duration,
    max_missed: u32,
}

impl LinkHealth {
    pub(crate) fn new(interval: Duration, max_missed: u32) -> Self {
        Self::new_at(interval, max_missed, Instant::now())
    }

    pub(crate) fn new_at(interval: Duration, max_missed: u32, now: Instant) -> Self {
        Self {
            state: LinkState::Connecting,
            last_seen: now,
            missed: 0,
            interval,
            max_missed: max_missed.max(1),
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        self.state
    }

    pub(crate) fn missed(&self) -> u32 {
        self.missed
    }

    pub(crate) fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Hello exchanged.
    pub(crate) fn established(&mut self) -> Option<LinkState> {
        self.transition(LinkState::Connecting, LinkState::Established)
    }

    /// Attached to the router and the first advert round queued.
    pub(crate) fn advertising(&mut self) -> Option<LinkState> {
        self.transition(LinkState::Established, LinkState::Advertising)
    }

    /// Any control message from the peer. Returns the new state if it changed.
    pub(crate) fn record(&mut self) -> Option<LinkState> {
        self.record_at(Instant::now())
    }

    pub(crate) fn record_at(&mut self, now: Instant) -> Option<LinkState> {
        if self.is_terminal() {
            return None;
        }
        self.last_seen = now;
        self.missed = 0;
        self.transition(LinkState::Degraded, LinkState::Advertising)
    }

    /// Keepalive tick. Returns the new state if it changed.
    pub(crate) fn check(&mut self) -> Option<LinkState> {
        self.check_at(Instant::now())
    }

    pub(crate) fn check_at(&mut self, now: Instant) -> Option<LinkState> {
        if self.is_terminal() {
            return None;
        }
        // Half an interval of slack so tick jitter is not counted as a miss.
        let late = self.idle_at(now).saturating_sub(self.interval / 2);
        let interval = self.interval.as_millis().max(1);
        self.missed = u32::try_from(late.as_millis() / interval).unwrap_or(u32::MAX);

        let next = if self.missed >= self.max_missed {
            LinkState::Disconnected
        } else if self.missed > 0 && self.state == LinkState::Advertising {
            LinkState::Degraded
        } else {
            return None;
        };
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }

    /// Explicit close, from any state.
    pub(crate) fn close(&mut self) -> Option<LinkState> {
        if self.state == LinkState::Closed {
            return None;
        }
        self.state = LinkState::Closed;
        Some(LinkState::Closed)
    }

    pub(crate) fn disconnect(&mut self) -> Option<LinkState> {
        if self.is_terminal() {
            return None;
        }
        self.state = LinkState::Disconnected;
        Some(LinkState::Disconnected)
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, LinkState::Disconnected | LinkState::Closed)
    }

    fn transition(&mut self, from: LinkState, to: LinkState) -> Option<LinkState> {
        if self.state != from {
            return None;
        }
        self.state = to;
        Some(to)
    }
}
