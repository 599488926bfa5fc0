//! Bootstrap discovery: one-shot lookups of candidate peer addresses.

mod dns;
mod http;
mod registry;

pub use dns::DnsResolver;
pub use http::HttpResolver;
pub use registry::RegistryResolver;

use std::collections::HashSet;
use std::fmt;

use crate::NetworkError;

/// Where a node looks for its first peers.
#[derive(Clone)]
pub enum Resolver {
    /// Instances of the overlay's own service in the registry.
    Registry(RegistryResolver),
    /// SRV (falling back to TXT) records of a DNS zone.
    Dns(DnsResolver),
    /// A JSON node list served over HTTP.
    Http(HttpResolver),
    /// A fixed list.
    Static(Vec<String>),
}

impl Resolver {
    /// Candidate peer addresses, deduplicated, first occurrence kept.
    ///
    /// An empty result is an error so callers treat the node as isolated.
    pub async fn resolve(&self) -> Result<Vec<String>, NetworkError> {
        let found = match self {
            Resolver::Registry(r) => r.resolve().await?,
            Resolver::Dns(r) => r.resolve().await?,
            Resolver::Http(r) => r.resolve().await?,
            Resolver::Static(nodes) => nodes.clone(),
        };
        let addresses = dedupe(found);
        if addresses.is_empty() {
            return Err(NetworkError::Resolve(format!("{} resolver found no peers", self.kind())));
        }
        tracing::debug!("{} resolver found {} peer(s)", self.kind(), addresses.len());
        Ok(addresses)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Resolver::Registry(_) => "registry",
            Resolver::Dns(_) => "dns",
            Resolver::Http(_) => "http",
            Resolver::Static(_) => "static",
        }
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolver::Registry(r) => f.debug_tuple("Registry").field(&r.service_name()).finish(),
            Resolver::Dns(r) => f.debug_tuple("Dns").field(&r.zone()).finish(),
            Resolver::Http(r) => f.debug_tuple("Http").field(&r.url()).finish(),
            Resolver::Static(nodes) => f.debug_tuple("Static").field(nodes).finish(),
        }
    }
}

fn dedupe(addresses: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty() && seen.insert(a.clone()))
        .collect()
}
