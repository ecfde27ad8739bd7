//! Topology reconciliation scenarios: convergence on the discovered
//! broker set, removals before additions, broken-connection sweeps,
//! and per-address failure isolation.

use relayq::flow::FlowControlEngine;
use relayq::pool::ConnectionPool;
use relayq::reconcile::TopologyReconciler;
use relayq::testing::{addr, MemoryConnector, NullDelivery, StaticDiscovery, StaticLoad};
use relayq::{Config, Error, Transport};
use relayq_protocol::{Address, Command, Topic};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixture {
    reconciler: Arc<TopologyReconciler>,
    discovery: Arc<StaticDiscovery>,
    connector: Arc<MemoryConnector>,
    pool: Arc<ConnectionPool>,
    flow: Arc<FlowControlEngine>,
}

fn fixture() -> Fixture {
    let config = Config::builder()
        .lookupd_http_address("127.0.0.1:4161")
        .channel("ch")
        .rdy_ack_timeout(Duration::from_millis(200))
        .build();
    let discovery = StaticDiscovery::arc();
    let connector = MemoryConnector::arc();
    let pool = Arc::new(ConnectionPool::new(
        connector.clone(),
        config.rdy_per_connection,
        config.query_timeout,
        config.pool_size_per_address,
    ));
    let flow = Arc::new(FlowControlEngine::new(&config, StaticLoad::arc(3)));
    let reconciler = Arc::new(TopologyReconciler::new(
        &config,
        discovery.clone(),
        pool.clone(),
        flow.clone(),
        NullDelivery::arc(),
        CancellationToken::new(),
    ));
    Fixture {
        reconciler,
        discovery,
        connector,
        pool,
        flow,
    }
}

fn sub_count(connector: &MemoryConnector, address: &Address) -> usize {
    connector
        .transports_for(address)
        .iter()
        .map(|t| {
            t.sent()
                .iter()
                .filter(|c| matches!(c, Command::Subscribe { .. }))
                .count()
        })
        .sum()
}

#[tokio::test]
async fn discovered_brokers_are_connected_subscribed_and_granted_credit() {
    // Scenario: discovery returns {B1, B2} for "orders", nothing held.
    let f = fixture();
    let b1 = addr("10.0.0.1", 4150);
    let b2 = addr("10.0.0.2", 4150);
    f.discovery.set_topic("orders", vec![b1.clone(), b2.clone()]);
    f.reconciler.subscribe(&Topic::new("orders"));

    f.reconciler.run_once().await.unwrap();

    let held = f.pool.held_addresses();
    assert_eq!(held.len(), 2);
    assert!(held.contains(&b1) && held.contains(&b2));

    for address in [&b1, &b2] {
        let transports = f.connector.transports_for(address);
        assert_eq!(transports.len(), 1);
        let names = transports[0].sent_names();
        assert_eq!(names[0], "SUB");
        assert_eq!(transports[0].last_rdy(), Some(1), "initial credit is 1");
    }
    assert_eq!(f.flow.total_rdy("orders"), 2);
    assert_eq!(f.flow.member_count("orders").await, 2);
}

#[tokio::test]
async fn topology_change_removes_and_adds_without_touching_survivors() {
    // Scenario: held {B1, B2}; discovery now returns {B2, B3}.
    let f = fixture();
    let b1 = addr("10.0.0.1", 4150);
    let b2 = addr("10.0.0.2", 4150);
    let b3 = addr("10.0.0.3", 4150);
    f.discovery.set_topic("orders", vec![b1.clone(), b2.clone()]);
    f.reconciler.subscribe(&Topic::new("orders"));
    f.reconciler.run_once().await.unwrap();

    f.discovery.set_topic("orders", vec![b2.clone(), b3.clone()]);
    f.reconciler.run_once().await.unwrap();

    let held = f.pool.held_addresses();
    assert!(!held.contains(&b1));
    assert!(held.contains(&b2) && held.contains(&b3));

    // B1's connection got the close handshake and was torn down
    let b1_transport = &f.connector.transports_for(&b1)[0];
    assert!(!b1_transport.is_connected());
    assert!(b1_transport.sent_names().contains(&"CLS"));

    // B2 was left alone: exactly one SUB ever, no reconnect
    assert_eq!(sub_count(&f.connector, &b2), 1);
    assert_eq!(f.connector.transports_for(&b2).len(), 1);

    assert_eq!(f.flow.member_count("orders").await, 2);
    assert_eq!(f.flow.total_rdy("orders"), 2);
}

#[tokio::test]
async fn unchanged_topology_produces_no_churn() {
    let f = fixture();
    let b1 = addr("10.0.0.1", 4150);
    let b2 = addr("10.0.0.2", 4150);
    f.discovery.set_topic("orders", vec![b1, b2]);
    f.reconciler.subscribe(&Topic::new("orders"));

    f.reconciler.run_once().await.unwrap();
    let dials = f.connector.dial_count();
    let held = f.pool.held_addresses();

    f.reconciler.run_once().await.unwrap();
    assert_eq!(f.connector.dial_count(), dials, "no new connections");
    assert_eq!(f.pool.held_addresses(), held, "held set unchanged");
}

#[tokio::test]
async fn broken_connections_are_closed_and_recreated() {
    let f = fixture();
    let b1 = addr("10.0.0.1", 4150);
    f.discovery.set_topic("orders", vec![b1.clone()]);
    f.reconciler.subscribe(&Topic::new("orders"));
    f.reconciler.run_once().await.unwrap();

    f.connector.transports_for(&b1)[0].disconnect();
    f.reconciler.run_once().await.unwrap();

    let transports = f.connector.transports_for(&b1);
    assert_eq!(transports.len(), 2, "broken link replaced by a fresh one");
    assert!(transports[1].is_connected());
    assert_eq!(f.flow.total_rdy("orders"), 1);
    assert_eq!(f.flow.member_count("orders").await, 1);
}

#[tokio::test]
async fn unreachable_address_does_not_block_the_rest() {
    let f = fixture();
    let b1 = addr("10.0.0.1", 4150);
    let b2 = addr("10.0.0.2", 4150);
    f.discovery.set_topic("orders", vec![b1.clone(), b2.clone()]);
    f.reconciler.subscribe(&Topic::new("orders"));
    f.connector.refuse(&b1);

    f.reconciler.run_once().await.unwrap();
    let held = f.pool.held_addresses();
    assert!(!held.contains(&b1));
    assert!(held.contains(&b2), "healthy address connected despite the broken one");

    // next cycle picks the recovered address up
    f.connector.accept(&b1);
    f.reconciler.run_once().await.unwrap();
    assert_eq!(f.pool.held_addresses().len(), 2);
}

#[tokio::test]
async fn discovery_failure_defers_to_the_next_tick() {
    let f = fixture();
    let b1 = addr("10.0.0.1", 4150);
    f.discovery.set_topic("orders", vec![b1.clone()]);
    f.reconciler.subscribe(&Topic::new("orders"));
    f.reconciler.run_once().await.unwrap();

    f.discovery.fail_topic("orders", true);
    let calls_before = f.discovery.resolve_calls();
    match f.reconciler.run_once().await {
        Err(Error::Discovery(_)) => {}
        other => panic!("expected discovery error, got {other:?}"),
    }
    // bounded retries: initial attempt plus lookup_max_retries
    assert_eq!(f.discovery.resolve_calls() - calls_before, 4);
    // held connections were not torn down by the failed round
    assert!(f.pool.held_addresses().contains(&b1));

    f.discovery.fail_topic("orders", false);
    f.reconciler.run_once().await.unwrap();
    assert!(f.pool.held_addresses().contains(&b1));
}

#[tokio::test]
async fn one_address_serving_many_topics_gets_one_connection_per_topic() {
    let f = fixture();
    let b1 = addr("10.0.0.1", 4150);
    f.discovery.set_topic("orders", vec![b1.clone()]);
    f.discovery.set_topic("invoices", vec![b1.clone()]);
    f.reconciler.subscribe(&Topic::new("orders"));
    f.reconciler.subscribe(&Topic::new("invoices"));

    f.reconciler.run_once().await.unwrap();

    assert_eq!(f.connector.transports_for(&b1).len(), 2);
    assert_eq!(f.flow.member_count("orders").await, 1);
    assert_eq!(f.flow.member_count("invoices").await, 1);
    assert_eq!(f.flow.total_rdy("orders"), 1);
    assert_eq!(f.flow.total_rdy("invoices"), 1);
}
