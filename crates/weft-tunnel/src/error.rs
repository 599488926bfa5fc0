//! Errors returned by the tunnel layer.

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial {address} timed out")]
    Timeout { address: String },

    #[error("authentication with {peer} failed: {reason}")]
    Auth { peer: String, reason: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("refusing to connect to ourselves at {address}")]
    SelfConnection { address: String },

    #[error("no connection to node {node_id}")]
    NoConnection { node_id: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("session {session} is closed")]
    SessionClosed { session: String },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tunnel is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TunnelError {
    /// True for token or identity mismatches. These are never retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, TunnelError::Auth { .. })
    }

    /// True for failures a caller may recover from by retrying or trying
    /// another peer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TunnelError::Dial { .. }
                | TunnelError::Timeout { .. }
                | TunnelError::NoConnection { .. }
                | TunnelError::ConnectionClosed
                | TunnelError::SessionClosed { .. }
                | TunnelError::Io(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for TunnelError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TunnelError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TunnelError::Codec(e.to_string())
    }
}
