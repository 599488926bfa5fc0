use std::fmt;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::transport::Transport;
use crate::TunnelError;

/// Bytes of framing and AEAD overhead allowed on top of a session message.
pub(crate) const FRAME_OVERHEAD: usize = 1024;

/// Configuration for a [`Tunnel`](crate::Tunnel).
///
/// All fields except the node id have defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use weft_tunnel::TunnelConfig;
///
/// let config = TunnelConfig::new("node-a")
///     .token("shared-secret")
///     .dial_timeout(Duration::from_secs(2));
/// ```
#[derive(Clone)]
pub struct TunnelConfig {
    /// Identity announced in the handshake.
    pub(crate) node_id: String,
    /// Shared secret; peers with a different token fail the handshake.
    pub(crate) token: String,
    /// Physical transport used to listen and dial.
    pub(crate) transport: Transport,
    /// Upper bound for connect + handshake.
    pub(crate) dial_timeout: Duration,
    /// Maximum session message size in bytes.
    pub(crate) max_message_size: usize,
    /// Per-session inbound message buffer.
    pub(crate) session_buffer: usize,
    /// Buffer of inbound sessions waiting for `accept()`.
    pub(crate) accept_buffer: usize,
    /// Redial policy for outbound connections that drop.
    pub(crate) reconnect: BackoffConfig,
}

impl TunnelConfig {
    /// Create a config with defaults for the given node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            token: "weft".to_string(),
            transport: Transport::Tcp,
            dial_timeout: Duration::from_secs(5),
            max_message_size: 4 * 1024 * 1024, // 4 MiB
            session_buffer: 256,
            accept_buffer: 128,
            reconnect: BackoffConfig::default(),
        }
    }

    /// Set the shared authentication token (default: `"weft"`).
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Select the physical transport (default: TCP).
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Set the dial + handshake timeout (default: 5 s).
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the maximum session message size (default: 4 MiB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the per-session inbound buffer (default: 256 messages). A session whose
    /// buffer fills is closed rather than stalling the connection.
    pub fn session_buffer(mut self, capacity: usize) -> Self {
        self.session_buffer = capacity;
        self
    }

    /// Set the inbound session backlog (default: 128).
    pub fn accept_buffer(mut self, capacity: usize) -> Self {
        self.accept_buffer = capacity;
        self
    }

    /// Set the redial policy for dropped outbound connections.
    pub fn reconnect(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect = backoff;
        self
    }

    /// The local node id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The configured dial timeout.
    pub fn dial_timeout_value(&self) -> Duration {
        self.dial_timeout
    }

    pub(crate) fn validate(&self) -> Result<(), TunnelError> {
        if self.node_id.trim().is_empty() {
            return Err(TunnelError::Config("node id must not be empty".into()));
        }
        if self.token.is_empty() {
            return Err(TunnelError::Config("token must not be empty".into()));
        }
        if self.dial_timeout.is_zero() {
            return Err(TunnelError::Config("dial timeout must be positive".into()));
        }
        if self.max_message_size == 0
            || self.max_message_size > u32::MAX as usize - FRAME_OVERHEAD
        {
            return Err(TunnelError::Config(format!(
                "max message size {} out of range",
                self.max_message_size
            )));
        }
        if self.session_buffer == 0 || self.accept_buffer == 0 {
            return Err(TunnelError::Config("buffers must be non-zero".into()));
        }
        self.reconnect.validate()
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("node_id", &self.node_id)
            .field("token", &"<redacted>")
            .field("transport", &self.transport)
            .field("dial_timeout", &self.dial_timeout)
            .field("max_message_size", &self.max_message_size)
            .field("session_buffer", &self.session_buffer)
            .field("accept_buffer", &self.accept_buffer)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}
