//! weft overlay network.
//!
//! Sits on top of [`weft_tunnel`]:
//!
//! - [`Resolver`] finds the first peers (registry, DNS, HTTP or a static list).
//! - [`Router`] owns the routing table and the advertisement protocol.
//! - [`Node`] keeps one control link per peer and binds it to the router.
//! - [`Proxy`] forwards calls hop by hop along the best routes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use weft_network::{
//!     MemoryRegistry, Node, NodeConfig, Proxy, ProxyConfig, Request, Router, RouterConfig,
//!     ServiceInstance,
//! };
//! use weft_tunnel::{Tunnel, TunnelConfig};
//!
//! # async fn example() -> Result<(), weft_network::NetworkError> {
//! let registry = MemoryRegistry::new();
//! registry.register(ServiceInstance::new("echo", "10.0.0.1:9000"));
//!
//! let tunnel = Tunnel::new(TunnelConfig::new("a1").token("secret"))?;
//! let router = Router::new(RouterConfig::new("a1"))?;
//! let node = Node::new(
//!     NodeConfig::new()
//!         .address("0.0.0.0:8085")
//!         .nodes(["10.0.0.2:8085"])
//!         .registry(Arc::new(registry)),
//!     tunnel.clone(),
//!     router.clone(),
//! )?;
//! node.connect().await?;
//!
//! let proxy = Proxy::new(ProxyConfig::new(), tunnel, router)?;
//! let response = proxy.call(Request::new("echo", "Echo.Call", b"hi".to_vec())).await?;
//! println!("{} bytes back", response.body.len());
//!
//! node.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod node;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod router;

pub use config::{
    AdvertiseStrategy, NodeConfig, ProxyConfig, RouterConfig, DEFAULT_ADDRESS, DEFAULT_NETWORK,
};
pub use error::NetworkError;
pub use node::{
    ControlMessage, Graph, GraphPeer, LinkInfo, LinkState, Node, NodeState, NodeStatus, Peer,
    CONTROL_CHANNEL,
};
pub use proxy::{
    handler_fn, CallOptions, FnHandler, Handler, HandlerError, Proxy, Request, Response,
    RPC_CHANNEL,
};
pub use registry::{MemoryRegistry, Registry, RegistryEvent, ServiceInstance};
pub use resolver::{DnsResolver, HttpResolver, RegistryResolver, Resolver};
pub use router::{Advert, AdvertOutcome, AdvertType, Route, RouteKey, Router, TableSnapshot};

/// Lock a std mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
