use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::{lock, TunnelError};

/// Lifecycle of a logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// A bidirectional, ordered, message-oriented stream multiplexed over a
/// tunnel connection.
///
/// Dropping a session closes it; the peer sees [`TunnelError::SessionClosed`]
/// on its next `recv`.
pub struct Session {
    id: String,
    channel: String,
    state: Arc<Mutex<SessionState>>,
    incoming: mpsc::Receiver<Bytes>,
    conn: Arc<Connection>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        channel: String,
        state: Arc<Mutex<SessionState>>,
        incoming: mpsc::Receiver<Bytes>,
        conn: Arc<Connection>,
    ) -> Self {
        Self {
            id,
            channel,
            state,
            incoming,
            conn,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Channel name the session was opened on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Authenticated node id of the peer.
    pub fn remote_node(&self) -> &str {
        &self.conn.remote_node
    }

    pub fn local_addr(&self) -> &str {
        &self.conn.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.conn.remote_addr
    }

    pub fn state(&self) -> SessionState {
        if self.conn.is_closed() {
            return SessionState::Closed;
        }
        *lock(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Send one message. Fails once either side has closed the session.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TunnelError> {
        if self.state() != SessionState::Open {
            return Err(self.closed_error());
        }
        let max = self.conn.max_message_size();
        if payload.len() > max {
            return Err(TunnelError::MessageTooLarge {
                size: payload.len(),
                max,
            });
        }
        self.conn.send_data(&self.id, payload.to_vec()).await
    }

    /// Receive the next message in order.
    ///
    /// Messages already delivered before a close are still returned; after
    /// that this yields [`TunnelError::SessionClosed`].
    pub async fn recv(&mut self) -> Result<Bytes, TunnelError> {
        match self.incoming.recv().await {
            Some(message) => Ok(message),
            None => {
                *lock(&self.state) = SessionState::Closed;
                Err(self.closed_error())
            }
        }
    }

    /// Close the session and tell the peer.
    pub async fn close(self) {
        let was_open = {
            let mut state = lock(&self.state);
            let open = *state == SessionState::Open;
            *state = SessionState::Closing;
            open
        };
        if was_open {
            self.conn.send_close(&self.id).await;
        }
        self.conn.release(&self.id, false);
        *lock(&self.state) = SessionState::Closed;
    }

    fn closed_error(&self) -> TunnelError {
        TunnelError::SessionClosed {
            session: self.id.clone(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let was_open = {
            let mut state = lock(&self.state);
            let open = *state == SessionState::Open;
            *state = SessionState::Closed;
            open
        };
        self.conn.release(&self.id, was_open);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("remote_node", &self.conn.remote_node)
            .field("state", &self.state())
            .finish()
    }
}
