//! Property tests for advert handling through the public Router API.

use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::mpsc;
use weft_network::{
    Advert, AdvertOutcome, AdvertType, AdvertiseStrategy, Route, Router, RouterConfig,
    DEFAULT_NETWORK,
};

fn arb_route() -> impl Strategy<Value = Route> {
    (
        prop::sample::select(vec!["echo", "kv", "auth"]),
        1u8..4,
        prop::sample::select(vec!["a1", "b1", "c1", "d1"]),
        0u32..5,
    )
        .prop_map(|(service, host, router, metric)| {
            let mut route = Route::local(service, format!("10.0.0.{host}:9000"), router, DEFAULT_NETWORK);
            route.link = String::new();
            route.metric = metric;
            route
        })
}

fn advert(origin: &str, sequence: u64, operation: AdvertType, routes: Vec<Route>) -> Advert {
    Advert {
        origin: origin.into(),
        sequence,
        operation,
        routes,
        ttl: Duration::from_secs(60),
    }
}

fn router(strategy: AdvertiseStrategy) -> Router {
    Router::new(RouterConfig::new("a1").strategy(strategy)).unwrap()
}

fn sorted(mut routes: Vec<Route>) -> Vec<Route> {
    routes.sort_by_key(Route::key);
    routes
}

fn drain(rx: &mut mpsc::Receiver<Advert>) -> Vec<Advert> {
    let mut out = Vec::new();
    while let Ok(advert) = rx.try_recv() {
        out.push(advert);
    }
    out
}

proptest! {
    #[test]
    fn replayed_advert_is_stale(routes in prop::collection::vec(arb_route(), 0..12), seq in 1u64..1_000_000) {
        let router = router(AdvertiseStrategy::Local);
        let _rx = router.add_link("link-b", "b1");

        let first = router.on_advert("link-b", advert("b1", seq, AdvertType::Create, routes.clone()));
        prop_assert!(matches!(first, AdvertOutcome::Applied { .. }), "first advert not applied: {:?}", first);
        let table = sorted(router.table());

        let replay = router.on_advert("link-b", advert("b1", seq, AdvertType::Create, routes));
        prop_assert_eq!(replay, AdvertOutcome::Stale);
        prop_assert_eq!(sorted(router.table()), table);
    }

    #[test]
    fn refreshing_same_routes_changes_nothing(routes in prop::collection::vec(arb_route(), 1..12)) {
        // One entry per identity, otherwise later duplicates rewrite earlier ones.
        let mut seen = std::collections::HashSet::new();
        let routes: Vec<Route> = routes.into_iter().filter(|r| seen.insert(r.key())).collect();
        let router = router(AdvertiseStrategy::Local);
        let _rx = router.add_link("link-b", "b1");

        router.on_advert("link-b", advert("b1", 10, AdvertType::Create, routes.clone()));
        let table = sorted(router.table());

        let refresh = router.on_advert("link-b", advert("b1", 11, AdvertType::Update, routes));
        prop_assert_eq!(refresh, AdvertOutcome::Applied { changed: 0 });
        prop_assert_eq!(sorted(router.table()), table);
    }

    #[test]
    fn learned_routes_point_back_at_the_sender(routes in prop::collection::vec(arb_route(), 0..12)) {
        let router = router(AdvertiseStrategy::Local);
        let _rx = router.add_link("link-b", "b1");
        router.on_advert("link-b", advert("b1", 1, AdvertType::Create, routes));

        for route in router.table() {
            prop_assert_ne!(&route.router, "a1");
            prop_assert_eq!(&route.gateway, "b1");
            prop_assert_eq!(&route.link, "link-b");
            prop_assert!(route.metric >= 1);
        }
    }

    #[test]
    fn deleting_unknown_routes_is_a_noop(routes in prop::collection::vec(arb_route(), 0..12)) {
        let router = router(AdvertiseStrategy::All);
        let _rx = router.add_link("link-b", "b1");

        let outcome = router.on_advert("link-b", advert("b1", 1, AdvertType::Delete, routes));
        prop_assert_eq!(outcome, AdvertOutcome::Applied { changed: 0 });
        prop_assert!(router.table().is_empty());
    }

    #[test]
    fn nothing_is_advertised_back_where_it_came_from(
        strategy in prop::sample::select(vec![
            AdvertiseStrategy::All,
            AdvertiseStrategy::Best,
            AdvertiseStrategy::Local,
        ]),
        routes in prop::collection::vec(arb_route(), 0..12),
    ) {
        let router = router(strategy);
        router.add_local_route("echo", "127.0.0.1:9000");
        let mut to_b = router.add_link("link-b", "b1");
        let mut to_c = router.add_link("link-c", "c1");
        drain(&mut to_b);
        drain(&mut to_c);

        router.on_advert("link-b", advert("b1", 1, AdvertType::Create, routes));

        prop_assert!(drain(&mut to_b).is_empty());
        for sent in drain(&mut to_c) {
            prop_assert_eq!(&sent.origin, "a1");
            for route in &sent.routes {
                prop_assert_ne!(&route.router, "c1");
                prop_assert_eq!(&route.gateway, "a1");
            }
        }
    }

    #[test]
    fn local_strategy_only_advertises_own_routes(
        own in prop::collection::vec(prop::sample::select(vec!["echo", "kv", "auth"]), 0..3),
        learned in prop::collection::vec(arb_route(), 0..12),
    ) {
        let router = router(AdvertiseStrategy::Local);
        for service in &own {
            router.add_local_route(service, "127.0.0.1:9000");
        }
        let _from_b = router.add_link("link-b", "b1");
        router.on_advert("link-b", advert("b1", 1, AdvertType::Create, learned));

        let mut to_c = router.add_link("link-c", "c1");
        let mut advertised = Vec::new();
        for sent in drain(&mut to_c) {
            prop_assert_eq!(sent.operation, AdvertType::Create);
            for route in sent.routes {
                prop_assert_eq!(&route.router, "a1");
                prop_assert_eq!(route.metric, 0);
                advertised.push(route.service);
            }
        }
        advertised.sort();
        advertised.dedup();
        let mut expected: Vec<String> = own.iter().map(|s| s.to_string()).collect();
        expected.sort();
        expected.dedup();
        prop_assert_eq!(advertised, expected);
    }

    #[test]
    fn strategy_none_never_queues_adverts(routes in prop::collection::vec(arb_route(), 0..12)) {
        let router = router(AdvertiseStrategy::None);
        router.add_local_route("echo", "127.0.0.1:9000");
        let mut to_b = router.add_link("link-b", "b1");
        let mut to_c = router.add_link("link-c", "c1");
        router.on_advert("link-b", advert("b1", 1, AdvertType::Create, routes));
        router.advertise();

        prop_assert!(drain(&mut to_b).is_empty());
        prop_assert!(drain(&mut to_c).is_empty());
    }
}

#[test]
fn removing_a_link_withdraws_what_it_taught() {
    let router = router(AdvertiseStrategy::All);
    let _from_b = router.add_link("link-b", "b1");
    let mut to_c = router.add_link("link-c", "c1");
    router.on_advert(
        "link-b",
        advert(
            "b1",
            1,
            AdvertType::Create,
            vec![Route::local("echo", "10.0.0.1:9000", "b1", DEFAULT_NETWORK)],
        ),
    );
    assert_eq!(router.lookup("echo").len(), 1);
    drain(&mut to_c);

    let removed = router.remove_link("link-b");
    assert_eq!(removed.len(), 1);
    assert!(router.lookup("echo").is_empty());

    let sent = drain(&mut to_c);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].operation, AdvertType::Delete);
    assert_eq!(sent[0].routes[0].service, "echo");
}
