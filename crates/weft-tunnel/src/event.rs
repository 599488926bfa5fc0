use std::time::Instant;

/// A change in the set of physical connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection finished its handshake.
    Up {
        node_id: String,
        address: String,
        outbound: bool,
    },
    /// A connection dropped. Every session on it is now closed.
    Down { node_id: String, address: String },
    /// A dropped outbound connection was redialled.
    Reconnected {
        node_id: String,
        address: String,
        attempts: u32,
    },
    /// Redialling gave up.
    Lost { address: String, attempts: u32 },
}

/// Summary of a live physical connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    /// Authenticated remote node id.
    pub node_id: String,
    pub local_address: String,
    pub remote_address: String,
    /// True if we dialled it.
    pub outbound: bool,
    /// Number of open sessions.
    pub sessions: usize,
    pub established_at: Instant,
}
