//! Overlay-level errors.
//!
//! Wraps tunnel errors and adds discovery, routing and forwarding variants.

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("tunnel error: {0}")]
    Tunnel(#[from] weft_tunnel::TunnelError),

    #[error("resolve failed: {0}")]
    Resolve(String),

    #[error("link to {peer} failed: {reason}")]
    Link { peer: String, reason: String },

    #[error("peer {peer} belongs to network {network}")]
    NetworkMismatch { peer: String, network: String },

    #[error("no route to service {service}")]
    RouteNotFound { service: String },

    #[error("forwarding {service} failed after {attempts} attempt(s): {last}")]
    Forward {
        service: String,
        attempts: usize,
        last: String,
    },

    #[error("call to {service} timed out")]
    Timeout { service: String },

    #[error("remote error from {service}: {message}")]
    Remote { service: String, message: String },

    #[error("call to {service} exceeded {hops} hops")]
    TooManyHops { service: String, hops: u32 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("node is shut down")]
    Shutdown,
}

impl NetworkError {
    /// Errors worth trying the next route candidate for.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Tunnel(e) => !e.is_auth(),
            NetworkError::Link { .. } | NetworkError::Deserialization(_) => true,
            _ => false,
        }
    }
}

impl From<rmp_serde::encode::Error> for NetworkError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for NetworkError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        NetworkError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_route_not_found() {
        let err = NetworkError::RouteNotFound {
            service: "echo".into(),
        };
        assert_eq!(err.to_string(), "no route to service echo");
    }

    #[test]
    fn display_forward() {
        let err = NetworkError::Forward {
            service: "echo".into(),
            attempts: 2,
            last: "connection closed".into(),
        };
        assert_eq!(
            err.to_string(),
            "forwarding echo failed after 2 attempt(s): connection closed"
        );
    }

    #[test]
    fn remote_errors_are_not_retried() {
        let remote = NetworkError::Remote {
            service: "echo".into(),
            message: "boom".into(),
        };
        assert!(!remote.is_retryable());
        assert!(NetworkError::Tunnel(weft_tunnel::TunnelError::ConnectionClosed).is_retryable());
        assert!(!NetworkError::Tunnel(weft_tunnel::TunnelError::Auth {
            peer: "a1".into(),
            reason: "token mismatch".into()
        })
        .is_retryable());
    }

    #[test]
    fn rmp_errors_convert() {
        let err: NetworkError = rmp_serde::from_slice::<String>(&[0xc1])
            .unwrap_err()
            .into();
        assert!(matches!(err, NetworkError::Deserialization(_)));
    }
}
