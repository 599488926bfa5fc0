//! Integration tests: small overlays of real nodes on the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use weft_network::{
    handler_fn, Advert, AdvertType, AdvertiseStrategy, ControlMessage, HandlerError, LinkState,
    MemoryRegistry, NetworkError, Node, NodeConfig, NodeState, Proxy, ProxyConfig, Request,
    Resolver, Response, Route, Router, RouterConfig, ServiceInstance, CONTROL_CHANNEL,
};
use weft_tunnel::{BackoffConfig, Session, Transport, Tunnel, TunnelConfig};

const TICK: Duration = Duration::from_millis(100);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

struct Member {
    node: Node,
    router: Router,
    proxy: Proxy,
    registry: MemoryRegistry,
    shutdown: CancellationToken,
}

impl Member {
    fn address(&self) -> String {
        self.node.address().expect("node not connected").to_string()
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.node.close().await.unwrap();
    }
}

fn member(
    id: &str,
    transport: &Transport,
    strategy: AdvertiseStrategy,
    configure: impl FnOnce(NodeConfig) -> NodeConfig,
) -> Member {
    member_on("weft", id, transport, strategy, configure)
}

fn member_on(
    network: &str,
    id: &str,
    transport: &Transport,
    strategy: AdvertiseStrategy,
    configure: impl FnOnce(NodeConfig) -> NodeConfig,
) -> Member {
    let registry = MemoryRegistry::new();
    let tunnel = Tunnel::new(TunnelConfig::new(id).transport(transport.clone())).unwrap();
    let router = Router::new(
        RouterConfig::new(id)
            .network(network)
            .strategy(strategy)
            .advert_interval(Duration::from_millis(300))
            .route_ttl(Duration::from_secs(3))
            .sweep_interval(TICK),
    )
    .unwrap();

    let config = NodeConfig::new()
        .address(format!("{id}:0"))
        .network(network)
        .keepalive(Duration::from_millis(250), 4)
        .resolve_interval(Duration::from_secs(1))
        .link_backoff(BackoffConfig {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(200),
            multiplier: 2,
            max_attempts: Some(10),
        })
        .shutdown(Duration::from_millis(500), Duration::from_secs(3))
        .registry(Arc::new(registry.clone()));
    let node = Node::new(configure(config), tunnel.clone(), router.clone()).unwrap();

    let proxy = Proxy::new(
        ProxyConfig::new().request_timeout(Duration::from_secs(5)),
        tunnel,
        router.clone(),
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let sessions = node.data_sessions().unwrap();
    let server = proxy.clone();
    let token = shutdown.clone();
    tokio::spawn(async move { server.serve(sessions, token).await });

    Member {
        node,
        router,
        proxy,
        registry,
        shutdown,
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn echo_handler() -> impl weft_network::Handler {
    handler_fn(|req: Request| async move {
        let mut response = Response::new(req.body);
        response
            .headers
            .insert("served-after-hops".into(), req.hops.to_string());
        Ok::<_, HandlerError>(response)
    })
}

/// a1 serves echo; b1 links to a1.
async fn linked_pair(transport: &Transport) -> (Member, Member) {
    let a1 = member("a1", transport, AdvertiseStrategy::Local, |c| c);
    a1.registry
        .register(ServiceInstance::new("echo", "10.0.0.1:9000"));
    a1.node.connect().await.unwrap();

    let a1_address = a1.address();
    let b1 = member("b1", transport, AdvertiseStrategy::Local, |c| {
        c.nodes([a1_address])
    });
    b1.node.connect().await.unwrap();
    eventually("b1 to learn echo", || !b1.router.lookup("echo").is_empty()).await;
    (a1, b1)
}

/// A bare tunnel posing as node a1: it links to `address`, advertises echo
/// with `ttl`, then holds the control session open without another word.
async fn silent_peer(transport: &Transport, address: &str, ttl: Duration) -> (Tunnel, Session) {
    let tunnel = Tunnel::new(TunnelConfig::new("a1").transport(transport.clone())).unwrap();
    let mut session = tunnel.dial(address, CONTROL_CHANNEL).await.unwrap();
    let hello = ControlMessage::Hello {
        node_id: "a1".into(),
        address: "a1:0".into(),
        network: "weft".into(),
    };
    session.send(&hello.to_bytes().unwrap()).await.unwrap();
    let reply = ControlMessage::from_bytes(&session.recv().await.unwrap()).unwrap();
    assert!(matches!(reply, ControlMessage::Hello { .. }), "got {reply:?}");

    let advert = ControlMessage::Advert(Advert {
        origin: "a1".into(),
        sequence: 1,
        operation: AdvertType::Create,
        routes: vec![Route::local("echo", "10.0.0.1:9000", "a1", "weft")],
        ttl,
    });
    session.send(&advert.to_bytes().unwrap()).await.unwrap();
    (tunnel, session)
}

#[tokio::test]
async fn local_registration_creates_one_route() {
    init_tracing();
    let transport = Transport::memory();
    let a1 = member("a1", &transport, AdvertiseStrategy::Local, |c| c);
    a1.registry
        .register(ServiceInstance::new("echo", "10.0.0.1:9000"));
    a1.node.connect().await.unwrap();

    let routes = a1.router.lookup("echo");
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].metric, 0);
    assert_eq!(routes[0].gateway, "a1");
    assert_eq!(routes[0].router, "a1");
    assert_eq!(routes[0].address, "10.0.0.1:9000");
    assert_eq!(a1.node.services(), vec!["echo".to_string()]);
    assert_eq!(a1.node.status().state, NodeState::Isolated);

    // Later registrations arrive through the watch stream
    a1.registry.register(ServiceInstance::new("kv", "10.0.0.2:1"));
    eventually("kv route", || !a1.router.lookup("kv").is_empty()).await;
    a1.registry.deregister("kv", "10.0.0.2:1");
    eventually("kv route removed", || a1.router.lookup("kv").is_empty()).await;

    a1.close().await;
}

#[tokio::test]
async fn peer_learns_route_one_hop_away() {
    init_tracing();
    let transport = Transport::memory();
    let (a1, b1) = linked_pair(&transport).await;

    let routes = b1.router.lookup("echo");
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].metric, 1);
    assert_eq!(routes[0].gateway, "a1");
    assert_eq!(routes[0].router, "a1");

    let peers = b1.node.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].node_id, "a1");
    assert!(peers[0].outbound);
    assert_eq!(peers[0].address, a1.address());
    eventually("a1 to see b1", || a1.node.peers().len() == 1).await;
    assert!(!a1.node.peers()[0].outbound);

    // b1 advertises nothing of its own, so a1 learns nothing back
    assert_eq!(a1.router.table().len(), 1);
    assert_eq!(b1.node.status().state, NodeState::Connected);

    b1.close().await;
    a1.close().await;
}

#[tokio::test]
async fn closing_a_node_withdraws_its_routes() {
    init_tracing();
    let transport = Transport::memory();
    let (a1, b1) = linked_pair(&transport).await;

    a1.close().await;
    eventually("echo withdrawn at b1", || b1.router.lookup("echo").is_empty()).await;
    eventually("link to a1 gone", || b1.node.peers().is_empty()).await;

    b1.close().await;
}

#[tokio::test]
async fn lost_link_is_withdrawn_then_redialled() {
    init_tracing();
    let transport = Transport::memory();
    let a1 = member("a1", &transport, AdvertiseStrategy::Local, |c| c);
    a1.registry
        .register(ServiceInstance::new("echo", "10.0.0.1:9000"));
    a1.node.connect().await.unwrap();
    let a1_address = a1.address();
    let b1 = member("b1", &transport, AdvertiseStrategy::Local, |c| {
        c.nodes([a1_address]).link_backoff(BackoffConfig {
            initial: Duration::from_millis(400),
            max: Duration::from_secs(1),
            multiplier: 2,
            max_attempts: Some(10),
        })
    });
    b1.node.connect().await.unwrap();
    eventually("b1 to learn echo", || !b1.router.lookup("echo").is_empty()).await;

    // Drop the physical connection from a1's side, without any goodbye
    assert!(a1.node.tunnel().disconnect("b1") > 0);
    eventually("echo withdrawn at b1", || b1.router.lookup("echo").is_empty()).await;
    eventually("echo relearned after redial", || {
        !b1.router.lookup("echo").is_empty()
    })
    .await;
    eventually("link back up", || {
        b1.node
            .peers()
            .iter()
            .any(|l| l.node_id == "a1" && l.state == LinkState::Advertising)
    })
    .await;

    b1.close().await;
    a1.close().await;
}

#[tokio::test]
async fn proxy_forwards_to_the_serving_node() {
    init_tracing();
    let transport = Transport::memory();
    let (a1, b1) = linked_pair(&transport).await;
    a1.proxy.register_handler("echo", echo_handler());

    let response = b1
        .proxy
        .call(Request::new("echo", "Echo.Call", b"ping".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.body, b"ping");
    assert_eq!(response.headers["served-after-hops"], "1");
    assert_eq!(b1.proxy.idle_sessions(), 1);

    // The parked session is reused
    let response = b1
        .proxy
        .call(Request::new("echo", "Echo.Call", b"again".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.body, b"again");
    assert_eq!(b1.proxy.idle_sessions(), 1);

    b1.close().await;
    a1.close().await;
}

#[tokio::test]
async fn remote_handler_error_is_not_retried() {
    init_tracing();
    let transport = Transport::memory();
    let (a1, b1) = linked_pair(&transport).await;
    a1.proxy.register_handler(
        "echo",
        handler_fn(|_req: Request| async move { Err::<Response, HandlerError>("boom".into()) }),
    );

    let err = b1
        .proxy
        .call(Request::new("echo", "Echo.Call", Vec::new()))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, NetworkError::Remote { service, message } if service == "echo" && message == "boom"),
        "unexpected error: {err}"
    );

    b1.close().await;
    a1.close().await;
}

#[tokio::test]
async fn unregistered_service_is_route_not_found() {
    init_tracing();
    let transport = Transport::memory();
    let (a1, b1) = linked_pair(&transport).await;

    let started = tokio::time::Instant::now();
    let err = b1
        .proxy
        .call(Request::new("unknown", "Nope.Call", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::RouteNotFound { service } if service == "unknown"));
    assert!(started.elapsed() < Duration::from_secs(1));

    b1.close().await;
    a1.close().await;
}

#[tokio::test]
async fn calls_cross_two_hops() {
    init_tracing();
    let transport = Transport::memory();

    let a1 = member("a1", &transport, AdvertiseStrategy::Local, |c| c);
    a1.registry
        .register(ServiceInstance::new("echo", "10.0.0.1:9000"));
    a1.proxy.register_handler("echo", echo_handler());
    a1.node.connect().await.unwrap();

    let a1_address = a1.address();
    let b1 = member("b1", &transport, AdvertiseStrategy::All, |c| {
        c.nodes([a1_address])
    });
    b1.node.connect().await.unwrap();

    // c1 finds b1 through a resolver rather than a static list
    let b1_address = b1.address();
    let c1 = member("c1", &transport, AdvertiseStrategy::Local, |c| {
        c.resolver(Resolver::Static(vec![b1_address]))
    });
    c1.node.connect().await.unwrap();

    eventually("c1 to learn echo", || !c1.router.lookup("echo").is_empty()).await;
    let routes = c1.router.lookup("echo");
    let route = &routes[0];
    assert_eq!(route.metric, 2);
    assert_eq!(route.gateway, "b1");
    assert_eq!(route.router, "a1");

    let response = c1
        .proxy
        .call(Request::new("echo", "Echo.Call", b"far".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.body, b"far");
    assert_eq!(response.headers["served-after-hops"], "2");

    let nodes = c1.node.nodes();
    let ids: Vec<(&str, u32)> = nodes.iter().map(|p| (p.id.as_str(), p.hops)).collect();
    assert_eq!(ids, vec![("c1", 0), ("b1", 1), ("a1", 2)]);

    let graph = c1.node.graph();
    assert_eq!(graph.peers.len(), 1);
    assert_eq!(graph.peers[0].link.node_id, "b1");
    assert_eq!(graph.peers[0].reachable[0].id, "a1");
    assert!(graph.to_json().unwrap().contains("\"reachable\""));

    c1.close().await;
    b1.close().await;
    a1.close().await;
}

#[tokio::test]
async fn strategy_none_advertises_nothing() {
    init_tracing();
    let transport = Transport::memory();
    let a1 = member("a1", &transport, AdvertiseStrategy::None, |c| c);
    a1.registry
        .register(ServiceInstance::new("echo", "10.0.0.1:9000"));
    a1.node.connect().await.unwrap();

    let a1_address = a1.address();
    let b1 = member("b1", &transport, AdvertiseStrategy::Local, |c| {
        c.nodes([a1_address])
    });
    b1.node.connect().await.unwrap();
    eventually("link up", || {
        b1.node
            .peers()
            .iter()
            .any(|l| l.state == LinkState::Advertising)
    })
    .await;

    // Several advert intervals pass without a single route
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(b1.router.table().is_empty());
    assert_eq!(a1.router.lookup("echo").len(), 1);

    b1.close().await;
    a1.close().await;
}

#[tokio::test]
async fn other_network_is_refused() {
    init_tracing();
    let transport = Transport::memory();
    let red = member_on("red", "a1", &transport, AdvertiseStrategy::Local, |c| c);
    red.node.connect().await.unwrap();

    let red_address = red.address();
    let blue = member_on("blue", "b1", &transport, AdvertiseStrategy::Local, |c| {
        c.nodes([red_address])
    });
    blue.node.connect().await.unwrap();

    assert!(blue.node.peers().is_empty());
    assert_eq!(blue.node.status().state, NodeState::Isolated);
    eventually("red drops the refused link", || red.node.peers().is_empty()).await;

    blue.close().await;
    red.close().await;
}

#[tokio::test]
async fn simultaneous_dials_settle_on_one_link() {
    init_tracing();
    let transport = Transport::memory();
    let a1 = member("a1", &transport, AdvertiseStrategy::Local, |c| {
        c.address("a1:7001").nodes(["b1:7002"])
    });
    let b1 = member("b1", &transport, AdvertiseStrategy::Local, |c| {
        c.address("b1:7002").nodes(["a1:7001"])
    });
    a1.registry.register(ServiceInstance::new("echo", "10.0.0.1:9000"));
    b1.registry.register(ServiceInstance::new("kv", "10.0.0.2:9000"));

    let (a, b) = tokio::join!(a1.node.connect(), b1.node.connect());
    a.unwrap();
    b.unwrap();

    // The link a1 dialled wins on both ends
    eventually("one link each way", || {
        let a_links = a1.node.peers();
        let b_links = b1.node.peers();
        a_links.len() == 1 && a_links[0].outbound && b_links.len() == 1 && !b_links[0].outbound
    })
    .await;
    eventually("routes exchanged", || {
        !a1.router.lookup("kv").is_empty() && !b1.router.lookup("echo").is_empty()
    })
    .await;

    b1.close().await;
    a1.close().await;
}

#[tokio::test]
async fn silent_peer_degrades_then_times_out() {
    init_tracing();
    let transport = Transport::memory();
    let b1 = member("b1", &transport, AdvertiseStrategy::Local, |c| {
        c.keepalive(Duration::from_millis(100), 5)
    });
    b1.node.connect().await.unwrap();

    let (peer, _session) = silent_peer(&transport, &b1.address(), Duration::from_secs(60)).await;
    eventually("b1 to learn echo", || !b1.router.lookup("echo").is_empty()).await;

    // The connection stays up; only the keepalives stop.
    eventually("link degraded", || {
        b1.node
            .peers()
            .iter()
            .any(|l| l.node_id == "a1" && l.state == LinkState::Degraded)
    })
    .await;
    eventually("echo withdrawn", || b1.router.lookup("echo").is_empty()).await;
    eventually("link dropped", || b1.node.peers().is_empty()).await;
    assert_eq!(b1.node.status().state, NodeState::Isolated);

    peer.close().await;
    b1.close().await;
}

#[tokio::test]
async fn unrefreshed_routes_expire_on_a_live_link() {
    init_tracing();
    let transport = Transport::memory();
    let b1 = member("b1", &transport, AdvertiseStrategy::Local, |c| {
        c.keepalive(Duration::from_secs(10), 3)
    });
    b1.node.connect().await.unwrap();

    let (peer, _session) =
        silent_peer(&transport, &b1.address(), Duration::from_millis(500)).await;
    eventually("b1 to learn echo", || !b1.router.lookup("echo").is_empty()).await;
    eventually("echo swept", || b1.router.lookup("echo").is_empty()).await;

    let links = b1.node.peers();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].node_id, "a1");
    assert_eq!(links[0].state, LinkState::Advertising);

    peer.close().await;
    b1.close().await;
}
