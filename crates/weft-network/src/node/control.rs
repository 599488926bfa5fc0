//! Messages exchanged on a link's control session.
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::router::Advert;
use crate::NetworkError;

/// Tunnel channel carrying link control traffic.
pub const CONTROL_CHANNEL: &str = "control";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// First message in each direction.
    Hello {
        node_id: String,
        /// Address the sender can be dialled on.
        address: String,
        network: String,
    },
    Advert(Advert),
    Keepalive {
        /// Sender clock, unix milliseconds.
        timestamp: u64,
    },
    /// Last message before the sender hangs up.
    Close { reason: String },
}

impl ControlMessage {
    pub fn keepalive() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ControlMessage::Keepalive { timestamp }
    }

    pub fn close(reason: impl Into<String>) -> Self {
        ControlMessage::Close {
            reason: reason.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Advert(_) => "advert",
            ControlMessage::Keepalive { .. } => "keepalive",
            ControlMessage::Close { .. } => "close",
        }
    }
}
