//! weft tunnel layer.
//!
//! One physical connection per peer, authenticated with a shared token and
//! sealed with XChaCha20-Poly1305, carrying any number of logical
//! [`Session`]s ("channels").
//!
//! # Quick start
//!
//! ```rust,no_run
//! use weft_tunnel::{Tunnel, TunnelConfig};
//!
//! # async fn example() -> Result<(), weft_tunnel::TunnelError> {
//! let tunnel = Tunnel::new(TunnelConfig::new("node-a").token("secret"))?;
//! let bound = tunnel.listen("127.0.0.1:0").await?;
//! println!("listening on {bound}");
//!
//! // Open a session on the "rpc" channel of a remote node
//! let mut session = tunnel.dial("10.0.0.2:8085", "rpc").await?;
//! session.send(b"hello").await?;
//! let reply = session.recv().await?;
//! println!("got {} bytes", reply.len());
//!
//! tunnel.close().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod config;
mod connection;
mod error;
mod event;
mod frame;
mod handshake;
mod session;
mod transport;
mod tunnel;

pub use backoff::{Backoff, BackoffConfig};
pub use config::TunnelConfig;
pub use error::TunnelError;
pub use event::{ConnectionEvent, ConnectionInfo};
pub use session::{Session, SessionState};
pub use transport::{MemoryTransport, Transport};
pub use tunnel::Tunnel;

/// Wire protocol version announced in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Lock a std mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
