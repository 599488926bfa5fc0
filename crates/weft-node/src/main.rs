mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use weft_network::{
    handler_fn, HandlerError, MemoryRegistry, Node, NodeConfig, Proxy, ProxyConfig, Registry,
    Request, Response, Router, RouterConfig, ServiceInstance,
};
use weft_tunnel::{Tunnel, TunnelConfig};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let id = cli
        .id
        .clone()
        .unwrap_or_else(|| format!("node-{}", std::process::id()));

    let memory = MemoryRegistry::new();
    for (service, address) in &cli.register {
        memory.register(ServiceInstance::new(service, address));
    }
    let registry: Arc<dyn Registry> = Arc::new(memory);

    let tunnel = Tunnel::new(TunnelConfig::new(&id).token(&cli.token))?;
    let router = Router::new(
        RouterConfig::new(&id)
            .network(&cli.network)
            .strategy(cli.advertise_strategy),
    )?;

    let mut config = NodeConfig::new()
        .address(&cli.address)
        .network(&cli.network)
        .nodes(cli.nodes.iter().cloned())
        .registry(registry.clone());
    if let Some(advertise) = &cli.advertise {
        config = config.advertise(advertise);
    }
    if let Some(resolver) = cli.resolver.build(&registry)? {
        config = config.resolver(resolver);
    }
    let node = Node::new(config, tunnel.clone(), router.clone())?;

    let mut proxy_config = ProxyConfig::new();
    for (name, gateway) in &cli.gateway_links {
        proxy_config = proxy_config.link(name, gateway);
    }
    let proxy = Proxy::new(proxy_config, tunnel, router)?;
    if cli.echo {
        for (service, _) in &cli.register {
            proxy.register_handler(
                service.clone(),
                handler_fn(|req: Request| async move {
                    Ok::<_, HandlerError>(Response::new(req.body))
                }),
            );
        }
    }

    let shutdown = CancellationToken::new();
    let sessions = node
        .data_sessions()
        .context("data sessions already taken")?;
    let server = {
        let proxy = proxy.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { proxy.serve(sessions, shutdown).await })
    };

    eprintln!("weft-node v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Node ID: {}", node.id());
    eprintln!("Network: {} ({})", node.network(), cli.advertise_strategy);

    node.connect().await?;
    eprintln!("Listening on {}", node.address().unwrap_or("?"));
    eprintln!();

    let mut status = (cli.status_interval > 0).then(|| {
        let mut interval = tokio::time::interval(Duration::from_secs(cli.status_interval));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted, leaving the network");
                break;
            }
            _ = tick(&mut status) => {
                match node.status().to_json() {
                    Ok(json) => println!("{json}"),
                    Err(e) => tracing::warn!("Status snapshot failed: {e}"),
                }
            }
        }
    }

    shutdown.cancel();
    node.close().await?;
    let _ = server.await;
    eprintln!("Node {} closed", node.id());
    Ok(())
}

/// Next status tick, or never when status output is off.
async fn tick(status: &mut Option<tokio::time::Interval>) {
    match status {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
