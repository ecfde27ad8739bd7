//! Flow-control engine properties: aggregate credit bounds,
//! backoff/resume round-trips, and redistribution behavior under load.

use relayq::flow::{FlowControlEngine, INITIAL_RDY};
use relayq::testing::{addr, MemoryTransport, StaticLoad};
use relayq::{Config, Connection};
use relayq_protocol::{Command, Topic};
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    Config::builder()
        .lookupd_http_address("127.0.0.1:4161")
        .channel("ch")
        .rdy_ack_timeout(Duration::from_millis(200))
        .build()
}

fn connection(id: u64, host: &str, max_rdy: u32) -> (Arc<Connection>, Arc<MemoryTransport>) {
    let transport = MemoryTransport::arc();
    let conn = Arc::new(Connection::new(
        id,
        addr(host, 4150),
        Topic::new("orders"),
        transport.clone(),
        max_rdy,
        Duration::from_millis(200),
    ));
    (conn, transport)
}

fn rdy_zero_count(transport: &MemoryTransport) -> usize {
    transport
        .sent()
        .iter()
        .filter(|c| matches!(c, Command::Ready { count: 0 }))
        .count()
}

#[tokio::test]
async fn double_backoff_drives_to_floor_only_once() {
    let engine = Arc::new(FlowControlEngine::new(&config(), StaticLoad::arc(3)));
    let (c1, t1) = connection(1, "10.0.0.1", 3);
    let (c2, t2) = connection(2, "10.0.0.2", 3);
    engine.register("orders", c1, INITIAL_RDY).await;
    engine.register("orders", c2, INITIAL_RDY).await;

    engine.backoff("orders").await;
    assert!(engine.is_backed_off("orders"));
    assert_eq!(engine.total_rdy("orders"), 0);
    assert_eq!(rdy_zero_count(&t1), 1);
    assert_eq!(rdy_zero_count(&t2), 1);

    // second backoff without a resume in between is a no-op
    engine.backoff("orders").await;
    assert_eq!(rdy_zero_count(&t1), 1);
    assert_eq!(rdy_zero_count(&t2), 1);
    assert!(engine.is_backed_off("orders"));
}

#[tokio::test]
async fn backoff_then_resume_restores_aggregate_credit() {
    let info = StaticLoad::arc(3);
    let engine = Arc::new(FlowControlEngine::new(&config(), info.clone()));
    let (c1, _t1) = connection(1, "10.0.0.1", 3);
    let (c2, _t2) = connection(2, "10.0.0.2", 3);
    engine.register("orders", c1.clone(), INITIAL_RDY).await;
    engine.register("orders", c2.clone(), INITIAL_RDY).await;

    // let credit grow under low load
    c1.increase_expected_rdy();
    c2.increase_expected_rdy();
    engine.redistribute().await;
    let before = engine.total_rdy("orders");
    assert!(before >= 2);

    engine.backoff("orders").await;
    assert_eq!(engine.total_rdy("orders"), 0);
    assert_eq!(c1.current_rdy(), 0);

    engine.resume("orders").await;
    assert!(!engine.is_backed_off("orders"));
    assert!(
        engine.total_rdy("orders") >= before,
        "resume must restore at least the pre-backoff aggregate ({} < {before})",
        engine.total_rdy("orders")
    );
}

#[tokio::test]
async fn aggregate_never_exceeds_cap_nor_goes_negative() {
    let rdy_per_connection = 2;
    let info = StaticLoad::arc(rdy_per_connection);
    let engine = Arc::new(FlowControlEngine::new(&config(), info));
    let (c1, _t1) = connection(1, "10.0.0.1", rdy_per_connection);
    let (c2, _t2) = connection(2, "10.0.0.2", rdy_per_connection);
    engine.register("orders", c1.clone(), INITIAL_RDY).await;
    engine.register("orders", c2.clone(), INITIAL_RDY).await;

    let cap = (rdy_per_connection * 2) as i64;
    for _ in 0..10 {
        c1.increase_expected_rdy();
        c2.increase_expected_rdy();
        engine.redistribute().await;
        let total = engine.total_rdy("orders");
        assert!(total <= cap, "aggregate {total} exceeded cap {cap}");
        assert!(total >= 0, "aggregate {total} went negative");
    }
    // both members saturated at their per-connection ceiling
    assert_eq!(engine.total_rdy("orders"), cap);
    assert_eq!(c1.current_rdy(), rdy_per_connection);

    engine.remove_connection(&c1).await;
    engine.remove_connection(&c2).await;
    assert_eq!(engine.total_rdy("orders"), 0);
}

#[tokio::test]
async fn high_load_with_timeout_risk_reclaims_credit() {
    let info = StaticLoad::arc(3);
    let engine = Arc::new(FlowControlEngine::new(&config(), info.clone()));
    let (c1, _t1) = connection(1, "10.0.0.1", 3);
    engine.register("orders", c1.clone(), INITIAL_RDY).await;

    for _ in 0..4 {
        c1.increase_expected_rdy();
        engine.redistribute().await;
    }
    assert_eq!(c1.current_rdy(), 3);

    info.set_load(2.0);
    info.set_may_timeout(true);
    engine.redistribute().await;
    assert_eq!(c1.current_rdy(), 2);
    engine.redistribute().await;
    engine.redistribute().await;
    // decrement floors at 1
    assert_eq!(c1.current_rdy(), 1);
    engine.redistribute().await;
    assert_eq!(c1.current_rdy(), 1);
    assert_eq!(engine.total_rdy("orders"), 1);
}

#[tokio::test]
async fn moderate_load_changes_nothing() {
    let info = StaticLoad::arc(3);
    let engine = Arc::new(FlowControlEngine::new(&config(), info.clone()));
    let (c1, t1) = connection(1, "10.0.0.1", 3);
    engine.register("orders", c1.clone(), INITIAL_RDY).await;
    let sent_before = t1.sent().len();

    // above the grow threshold but below the high-water mark
    info.set_load(1.6);
    engine.redistribute().await;
    assert_eq!(t1.sent().len(), sent_before);

    // high load alone, without timeout risk, also changes nothing
    info.set_load(2.5);
    info.set_may_timeout(false);
    engine.redistribute().await;
    assert_eq!(t1.sent().len(), sent_before);
}

#[tokio::test]
async fn backed_off_topics_get_no_credit_from_redistribution() {
    let info = StaticLoad::arc(3);
    let engine = Arc::new(FlowControlEngine::new(&config(), info));
    let (c1, t1) = connection(1, "10.0.0.1", 3);
    engine.register("orders", c1.clone(), INITIAL_RDY).await;
    engine.backoff("orders").await;

    let sent_before = t1.sent().len();
    c1.increase_expected_rdy();
    engine.redistribute().await;
    engine.redistribute().await;
    assert_eq!(t1.sent().len(), sent_before, "backed-off topic must not receive credit");
    assert_eq!(engine.total_rdy("orders"), 0);
}

#[tokio::test]
async fn topics_are_isolated_from_each_other() {
    let info = StaticLoad::arc(3);
    let engine = Arc::new(FlowControlEngine::new(&config(), info));
    let (c1, _t1) = connection(1, "10.0.0.1", 3);
    let transport = MemoryTransport::arc();
    let c2 = Arc::new(Connection::new(
        2,
        addr("10.0.0.2", 4150),
        Topic::new("invoices"),
        transport,
        3,
        Duration::from_millis(200),
    ));
    engine.register("orders", c1, INITIAL_RDY).await;
    engine.register("invoices", c2, INITIAL_RDY).await;

    engine.backoff("orders").await;
    assert!(engine.is_backed_off("orders"));
    assert!(!engine.is_backed_off("invoices"));
    assert_eq!(engine.total_rdy("orders"), 0);
    assert_eq!(engine.total_rdy("invoices"), 1);
}
