//! High-level subscriber.
//!
//! Wires the whole consume path together: discovery → topology
//! reconciliation → connection pool → flow control → dispatcher →
//! application handler → acknowledgement command back to the
//! connection. The application supplies a [`Handler`] and a
//! [`Config`]; topology, connection lifecycle, backpressure, retry and
//! compensation are owned by the SDK.
//!
//! # Example
//!
//! ```rust,ignore
//! use relayq::{Config, Consumer};
//!
//! let config = Config::builder()
//!     .lookupd_http_address("10.0.0.5:4161")
//!     .channel("billing")
//!     .build();
//!
//! let consumer = Consumer::new(config, handler, connector)?;
//! consumer.subscribe(Topic::new("orders"));
//! consumer.start().await?;
//! // ... later
//! consumer.close().await;
//! ```

use crate::config::Config;
use crate::connection::Connection;
use crate::dispatch::{CompensationPublisher, DispatchStats, Dispatcher, Handler};
use crate::error::{Error, Result};
use crate::flow::{ConsumeInfo, FlowControlEngine};
use crate::lookup::{Discovery, LookupClient};
use crate::pool::ConnectionPool;
use crate::producer::Producer;
use crate::reconcile::{DeliverySink, TopologyReconciler};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relayq_protocol::{BrokerError, BrokerErrorCode, Connector, Frame, Topic};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot of the consume-side counters.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerStats {
    pub received: u64,
    pub success: u64,
    pub finished: u64,
    pub requeued: u64,
    pub queued: i64,
}

/// Load signals derived from dispatcher counters, sampled periodically
/// so the flow-control engine can see a consumption rate.
pub struct ConsumptionMeter {
    stats: Arc<DispatchStats>,
    rdy_per_connection: u32,
    message_timeout_ms: f32,
    window: Mutex<RateWindow>,
}

struct RateWindow {
    last_success: u64,
    rate_per_sec: f32,
    sampled_at: Instant,
}

impl ConsumptionMeter {
    fn new(config: &Config, stats: Arc<DispatchStats>) -> Self {
        Self {
            stats,
            rdy_per_connection: config.rdy_per_connection,
            message_timeout_ms: config.message_timeout.as_millis() as f32,
            window: Mutex::new(RateWindow {
                last_success: 0,
                rate_per_sec: 0.0,
                sampled_at: Instant::now(),
            }),
        }
    }

    /// Refresh the consumption rate from the success counter.
    pub fn sample(&self) {
        let mut window = self.window.lock();
        let success = self.stats.success();
        let elapsed = window.sampled_at.elapsed().as_secs_f32();
        if elapsed > 0.0 {
            window.rate_per_sec = (success - window.last_success) as f32 / elapsed;
        }
        window.last_success = success;
        window.sampled_at = Instant::now();
    }
}

impl ConsumeInfo for ConsumptionMeter {
    fn load_factor(&self) -> f32 {
        self.stats.load_factor()
    }

    fn consumption_may_timeout(&self) -> bool {
        let rate = self.window.lock().rate_per_sec;
        rate * self.stats.queued() as f32 * 1000.0 >= self.message_timeout_ms
    }

    fn rdy_per_connection(&self) -> u32 {
        self.rdy_per_connection
    }
}

/// Compensation producer created lazily on the first poison message.
struct LazyCompensator {
    config: Arc<Config>,
    discovery: Arc<dyn Discovery>,
    connector: Arc<dyn Connector>,
    producer: OnceCell<Arc<Producer>>,
}

#[async_trait]
impl CompensationPublisher for LazyCompensator {
    async fn publish(&self, topic: &Topic, body: Bytes) -> Result<()> {
        let producer = self
            .producer
            .get_or_try_init(|| async {
                info!("creating compensation producer");
                let producer = Producer::with_discovery(
                    (*self.config).clone(),
                    self.discovery.clone(),
                    self.connector.clone(),
                );
                producer.start()?;
                Ok::<_, Error>(producer)
            })
            .await?;
        CompensationPublisher::publish(producer.as_ref(), topic, body).await
    }
}

/// State shared with per-connection delivery loops.
struct ConsumerShared {
    config: Arc<Config>,
    discovery: Arc<dyn Discovery>,
    pool: Arc<ConnectionPool>,
    flow: Arc<FlowControlEngine>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl DeliverySink for ConsumerShared {
    fn attach(&self, conn: Arc<Connection>, mut frames: mpsc::Receiver<Frame>) {
        let config = self.config.clone();
        let discovery = self.discovery.clone();
        let pool = self.pool.clone();
        let flow = self.flow.clone();
        let dispatcher = self.dispatcher.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            debug!(connection = conn.id(), address = %conn.address(), "delivery loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => {
                        let Some(frame) = frame else { break };
                        route_frame(frame, &conn, &config, &discovery, &pool, &flow, &dispatcher)
                            .await;
                    }
                }
            }
            debug!(connection = conn.id(), "delivery loop ended");
        });
    }
}

async fn route_frame(
    frame: Frame,
    conn: &Arc<Connection>,
    config: &Arc<Config>,
    discovery: &Arc<dyn Discovery>,
    pool: &Arc<ConnectionPool>,
    flow: &Arc<FlowControlEngine>,
    dispatcher: &Arc<Dispatcher>,
) {
    match frame {
        Frame::Message(mut message) => {
            message.address = conn.address().clone();
            message.connection_id = conn.id();
            if message.next_consume_delay.is_none() {
                message.next_consume_delay = config.default_requeue_delay;
            }
            match dispatcher.submit(message, conn.clone()).await {
                Ok(()) => {}
                Err(Error::OrderViolation { detail, .. }) => {
                    error!(connection = conn.id(), detail, "rejected out-of-order delivery");
                }
                Err(Error::WorkerSaturated) => {
                    // already requeued and backed off by the dispatcher
                }
                Err(e) => {
                    warn!(connection = conn.id(), error = %e, "failed to dispatch message");
                }
            }
        }
        Frame::Response(ref body) if body.as_ref() == b"_heartbeat_" => {
            if let Err(e) = conn.nop().await {
                warn!(connection = conn.id(), error = %e, "failed to answer heartbeat");
            }
        }
        Frame::Response(body) => {
            debug!(connection = conn.id(), bytes = body.len(), "response frame");
        }
        Frame::Error(err) => {
            handle_broker_error(err, conn, discovery, pool, flow).await;
        }
    }
}

/// Broker error frames on a subscribed connection. Stale-topology
/// codes invalidate the discovery cache and drop the connection; the
/// reconciler re-resolves on its next cycle.
async fn handle_broker_error(
    err: BrokerError,
    conn: &Arc<Connection>,
    discovery: &Arc<dyn Discovery>,
    pool: &Arc<ConnectionPool>,
    flow: &Arc<FlowControlEngine>,
) {
    warn!(
        connection = conn.id(),
        address = %conn.address(),
        code = %err.code,
        message = %err.message,
        "broker reported error"
    );
    if err.code.invalidates_topology() {
        discovery.invalidate(&conn.topic().name);
        for released in pool.release_subscribed(conn.address()) {
            flow.remove_connection(&released).await;
            released.close().await;
        }
        info!(address = %conn.address(), "dropped connections after broker topology error");
    } else if err.code == BrokerErrorCode::SubOrderRequired {
        error!(
            topic = %conn.topic(),
            "topic requires ordered-mode subscription; check the `ordered` config flag"
        );
    }
}

pub struct Consumer {
    shared: Arc<ConsumerShared>,
    reconciler: Arc<TopologyReconciler>,
    meter: Arc<ConsumptionMeter>,
    lookup: Option<Arc<LookupClient>>,
    started: AtomicBool,
    closing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Consumer {
    /// Consumer with its own lookup client against the configured
    /// directory endpoints. The transport is supplied by the embedding
    /// application through `connector`.
    ///
    /// Must be called within a Tokio runtime: the dispatcher workers
    /// are spawned here.
    pub fn new(
        config: Config,
        handler: Arc<dyn Handler>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let lookup = Arc::new(LookupClient::new(&config, cancel.child_token())?);
        Ok(Self::assemble(
            config,
            handler,
            lookup.clone(),
            Some(lookup),
            connector,
            cancel,
        ))
    }

    /// Consumer over an externally supplied discovery implementation.
    pub fn with_discovery(
        config: Config,
        handler: Arc<dyn Handler>,
        discovery: Arc<dyn Discovery>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Self::assemble(
            config,
            handler,
            discovery,
            None,
            connector,
            CancellationToken::new(),
        )
    }

    fn assemble(
        config: Config,
        handler: Arc<dyn Handler>,
        discovery: Arc<dyn Discovery>,
        lookup: Option<Arc<LookupClient>>,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let stats = Arc::new(DispatchStats::default());
        let meter = Arc::new(ConsumptionMeter::new(&config, stats.clone()));
        let flow = Arc::new(FlowControlEngine::new(&config, meter.clone()));
        let compensator = Arc::new(LazyCompensator {
            config: config.clone(),
            discovery: discovery.clone(),
            connector: connector.clone(),
            producer: OnceCell::new(),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            handler,
            flow.clone(),
            compensator,
            stats,
        ));
        let pool = Arc::new(ConnectionPool::new(
            connector,
            config.rdy_per_connection,
            config.query_timeout,
            config.pool_size_per_address,
        ));
        let shared = Arc::new(ConsumerShared {
            config: config.clone(),
            discovery: discovery.clone(),
            pool: pool.clone(),
            flow: flow.clone(),
            dispatcher,
            cancel: cancel.clone(),
        });
        let reconciler = Arc::new(TopologyReconciler::new(
            &config,
            discovery,
            pool,
            flow,
            shared.clone(),
            cancel,
        ));
        Arc::new(Self {
            shared,
            reconciler,
            meter,
            lookup,
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe a topic (optionally pinned to one partition). Takes
    /// effect on the next reconciliation cycle.
    pub fn subscribe(&self, topic: Topic) {
        self.reconciler.subscribe(&topic);
    }

    pub fn subscribe_topics(&self, names: &[&str]) {
        for name in names {
            self.subscribe(Topic::new(*name));
        }
    }

    /// Start the periodic schedulers and connect to the current
    /// topology. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.shared.config.validate_for_consume()?;
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        if self.reconciler.subscribed_topics().is_empty() {
            warn!("no topic subscribed");
        }

        let mut tasks = self.tasks.lock();
        if let Some(lookup) = &self.lookup {
            tasks.push(lookup.spawn_endpoint_refresh());
        }
        tasks.push(self.reconciler.spawn());
        tasks.push(
            self.shared
                .flow
                .spawn(self.shared.cancel.child_token()),
        );

        // stats/rate sampling on the reconcile cadence
        let meter = self.meter.clone();
        let shared = self.shared.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = sleep(shared.config.reconcile_interval) => {}
                }
                meter.sample();
                let stats = shared.dispatcher.stats();
                info!(
                    received = stats.received(),
                    success = stats.success(),
                    finished = stats.finished(),
                    requeued = stats.requeued(),
                    queued = stats.queued(),
                    "consumer counters"
                );
            }
        }));
        drop(tasks);

        info!("consumer started");
        Ok(())
    }

    /// Run one reconciliation cycle immediately instead of waiting for
    /// the scheduler tick.
    pub async fn reconcile_now(&self) -> Result<()> {
        self.reconciler.run_once().await
    }

    /// Suspend credit for a topic (Active → Backoff).
    pub async fn backoff(&self, topic: &str) {
        self.shared.flow.backoff(topic).await;
    }

    /// Restore credit for a topic (Backoff → Active).
    pub async fn resume(&self, topic: &str) {
        self.shared.flow.resume(topic).await;
    }

    pub fn stats(&self) -> ConsumerStats {
        let stats = self.shared.dispatcher.stats();
        ConsumerStats {
            received: stats.received(),
            success: stats.success(),
            finished: stats.finished(),
            requeued: stats.requeued(),
            queued: stats.queued(),
        }
    }

    /// Graceful shutdown: stop the schedulers, give in-flight handler
    /// work the configured grace period, then unsubscribe every
    /// connection with a close handshake and tear the transports down.
    pub async fn close(&self) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.shared.cancel.cancel();
        self.shared
            .dispatcher
            .shutdown(self.shared.config.shutdown_grace)
            .await;

        for address in self.shared.pool.held_addresses() {
            for conn in self.shared.pool.release_subscribed(&address) {
                self.shared.flow.remove_connection(&conn).await;
                conn.close().await;
            }
        }
        self.shared.flow.clear();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("consumer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerError;
    use crate::testing::{addr, MemoryConnector, StaticDiscovery};
    use relayq_protocol::{Message, MessageId, Transport};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _message: &Message) -> std::result::Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> Config {
        Config::builder()
            .lookupd_http_address("127.0.0.1:4161")
            .channel("ch")
            .worker_count(2)
            .rdy_ack_timeout(Duration::from_millis(100))
            .shutdown_grace(Duration::from_millis(500))
            .build()
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held: {what}");
    }

    #[tokio::test]
    async fn delivers_messages_to_the_handler_and_finishes() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let discovery = StaticDiscovery::arc();
        let connector = MemoryConnector::arc();
        let consumer = Consumer::with_discovery(
            config(),
            handler.clone(),
            discovery.clone(),
            connector.clone(),
        );

        let a = addr("10.0.0.1", 4150);
        discovery.set_topic("orders", vec![a.clone()]);
        consumer.subscribe(Topic::new("orders"));
        consumer.start().await.unwrap();
        consumer.reconcile_now().await.unwrap();

        let delivered = connector
            .deliver(
                &a,
                Frame::Message(Message::new(
                    MessageId([7; 16]),
                    1,
                    0,
                    Bytes::from_static(b"hello"),
                )),
            )
            .await;
        assert!(delivered);

        eventually("handler called", || {
            handler.calls.load(Ordering::SeqCst) == 1
        })
        .await;
        eventually("FIN sent", || {
            connector.transports_for(&a)[0]
                .sent_names()
                .contains(&"FIN")
        })
        .await;
        assert_eq!(consumer.stats().received, 1);

        consumer.close().await;
        assert!(!connector.transports_for(&a)[0].is_connected());
    }

    #[tokio::test]
    async fn heartbeat_probe_is_answered_with_nop() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let discovery = StaticDiscovery::arc();
        let connector = MemoryConnector::arc();
        let consumer =
            Consumer::with_discovery(config(), handler, discovery.clone(), connector.clone());

        let a = addr("10.0.0.1", 4150);
        discovery.set_topic("orders", vec![a.clone()]);
        consumer.subscribe(Topic::new("orders"));
        consumer.start().await.unwrap();
        consumer.reconcile_now().await.unwrap();

        connector
            .deliver(&a, Frame::Response(Bytes::from_static(b"_heartbeat_")))
            .await;
        eventually("NOP sent", || {
            connector.transports_for(&a)[0]
                .sent_names()
                .contains(&"NOP")
        })
        .await;
        consumer.close().await;
    }

    #[tokio::test]
    async fn topology_error_invalidates_cache_and_drops_connection() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let discovery = StaticDiscovery::arc();
        let connector = MemoryConnector::arc();
        let consumer =
            Consumer::with_discovery(config(), handler, discovery.clone(), connector.clone());

        let a = addr("10.0.0.1", 4150);
        discovery.set_topic("orders", vec![a.clone()]);
        consumer.subscribe(Topic::new("orders"));
        consumer.start().await.unwrap();
        consumer.reconcile_now().await.unwrap();

        connector
            .deliver(
                &a,
                Frame::Error(BrokerError::parse("E_FAILED_ON_NOT_LEADER electing")),
            )
            .await;

        eventually("cache invalidated", || {
            discovery.invalidations().contains(&"orders".to_string())
        })
        .await;
        eventually("connection closed", || {
            !connector.transports_for(&a)[0].is_connected()
        })
        .await;

        // next cycle re-resolves and reconnects
        consumer.reconcile_now().await.unwrap();
        assert_eq!(connector.transports_for(&a).len(), 2);
        consumer.close().await;
    }
}
