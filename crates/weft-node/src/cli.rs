use std::sync::Arc;

use clap::Parser;
use weft_network::{
    AdvertiseStrategy, DnsResolver, HttpResolver, NetworkError, Registry, RegistryResolver,
    Resolver, DEFAULT_ADDRESS, DEFAULT_NETWORK,
};

#[derive(Parser, Debug)]
#[command(name = "weft-node", about = "Run one weft overlay node", version)]
pub struct Cli {
    /// Node id, unique within the network. Defaults to one derived from the pid.
    #[arg(long, env = "WEFT_NETWORK_ID")]
    pub id: Option<String>,

    /// Address to listen on.
    #[arg(long, env = "WEFT_NETWORK_ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Address peers should dial, when it differs from the bound one.
    #[arg(long, env = "WEFT_NETWORK_ADVERTISE")]
    pub advertise: Option<String>,

    /// Network name; peers on another network are refused.
    #[arg(long, env = "WEFT_NETWORK_NAME", default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// Static peer addresses (comma-separated).
    #[arg(long, env = "WEFT_NETWORK_NODES", value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Shared tunnel secret.
    #[arg(long, env = "WEFT_NETWORK_TOKEN", default_value = "weft", hide_env_values = true)]
    pub token: String,

    /// Peer discovery: static, registry, dns:<zone> or http:<url>.
    #[arg(long, env = "WEFT_NETWORK_RESOLVER", default_value = "static", value_parser = parse_resolver)]
    pub resolver: ResolverArg,

    /// Which routes to advertise: all, best, local or none.
    #[arg(long, env = "WEFT_NETWORK_ADVERTISE_STRATEGY", default_value = "local", value_parser = parse_strategy)]
    pub advertise_strategy: AdvertiseStrategy,

    /// Named links for calls, as name=gateway (repeatable).
    #[arg(long = "gateway-link", env = "WEFT_NETWORK_GATEWAY_LINKS", value_delimiter = ',', value_parser = parse_pair)]
    pub gateway_links: Vec<(String, String)>,

    /// Local services to advertise, as service=address (repeatable).
    #[arg(long = "register", env = "WEFT_NETWORK_REGISTER", value_delimiter = ',', value_parser = parse_pair)]
    pub register: Vec<(String, String)>,

    /// Answer calls for registered services by echoing the request body.
    #[arg(long)]
    pub echo: bool,

    /// Print the node status as JSON every N seconds (0 = never).
    #[arg(long, default_value = "0")]
    pub status_interval: u64,
}

/// Peer discovery chosen on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverArg {
    /// Only `--nodes`.
    Static,
    Registry,
    Dns(String),
    Http(String),
}

impl ResolverArg {
    /// The resolver to hand the node, if any beyond the static list.
    pub fn build(&self, registry: &Arc<dyn Registry>) -> Result<Option<Resolver>, NetworkError> {
        Ok(match self {
            ResolverArg::Static => None,
            ResolverArg::Registry => Some(Resolver::Registry(RegistryResolver::new(
                registry.clone(),
            ))),
            ResolverArg::Dns(zone) => Some(Resolver::Dns(DnsResolver::new(zone))),
            ResolverArg::Http(url) => Some(Resolver::Http(HttpResolver::new(url)?)),
        })
    }
}

pub fn parse_resolver(s: &str) -> Result<ResolverArg, String> {
    let s = s.trim();
    match s.split_once(':') {
        None if s.eq_ignore_ascii_case("static") => Ok(ResolverArg::Static),
        None if s.eq_ignore_ascii_case("registry") => Ok(ResolverArg::Registry),
        Some((kind, rest)) if kind.eq_ignore_ascii_case("dns") && !rest.is_empty() => {
            Ok(ResolverArg::Dns(rest.to_string()))
        }
        Some((kind, rest)) if kind.eq_ignore_ascii_case("http") && !rest.is_empty() => {
            Ok(ResolverArg::Http(rest.to_string()))
        }
        _ => Err(format!(
            "unknown resolver {s:?} (expected static, registry, dns:<zone> or http:<url>)"
        )),
    }
}

pub fn parse_strategy(s: &str) -> Result<AdvertiseStrategy, String> {
    s.parse().map_err(|e: NetworkError| e.to_string())
}

/// `key=value`, both sides non-empty.
pub fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}
