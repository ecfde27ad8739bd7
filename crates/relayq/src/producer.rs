//! Publisher.
//!
//! Resolves per-shard broker addresses through the same discovery
//! layer the consumer uses, borrows pooled connections, retries with
//! exponential backoff, and invalidates the discovery cache whenever a
//! connection cannot be found for the resolved address set. A
//! background sweep releases pooled resources for topics that have
//! been inactive beyond the configured expiration.
//!
//! # Example
//!
//! ```rust,ignore
//! use relayq::{Config, Producer};
//!
//! let config = Config::builder()
//!     .lookupd_http_address("10.0.0.5:4161")
//!     .build();
//! let producer = Producer::new(config, connector)?;
//! producer.start()?;
//! producer.publish(&Topic::new("orders"), Bytes::from("payload")).await?;
//! ```

use crate::config::Config;
use crate::dispatch::CompensationPublisher;
use crate::error::{Error, Result};
use crate::lookup::{Discovery, LookupClient, ShardingKey};
use crate::pool::{ConnectionPool, PooledConnection};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use relayq_protocol::{Address, BrokerErrorCode, Command, Connector, Frame, Topic};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Publish-side counters.
#[derive(Debug, Clone, Copy)]
pub struct ProducerStats {
    pub total: u64,
    pub success: u64,
}

pub struct Producer {
    config: Arc<Config>,
    discovery: Arc<dyn Discovery>,
    /// Present when the producer owns its own lookup client and must
    /// run the endpoint refresh for it.
    lookup: Option<Arc<LookupClient>>,
    pool: Arc<ConnectionPool>,
    cursor: AtomicUsize,
    topic_last_active: DashMap<String, Instant>,
    total: AtomicU64,
    success: AtomicU64,
    started: AtomicBool,
    closing: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Producer {
    /// Producer with its own lookup client against the configured
    /// directory endpoints.
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let lookup = Arc::new(LookupClient::new(&config, cancel.child_token())?);
        Ok(Self::assemble(
            config,
            lookup.clone(),
            Some(lookup),
            connector,
            cancel,
        ))
    }

    /// Producer over an externally supplied discovery implementation.
    pub fn with_discovery(
        config: Config,
        discovery: Arc<dyn Discovery>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Self::assemble(config, discovery, None, connector, CancellationToken::new())
    }

    fn assemble(
        config: Config,
        discovery: Arc<dyn Discovery>,
        lookup: Option<Arc<LookupClient>>,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new(
            connector,
            config.rdy_per_connection,
            config.query_timeout,
            config.pool_size_per_address,
        ));
        Arc::new(Self {
            config: Arc::new(config),
            discovery,
            lookup,
            pool,
            cursor: AtomicUsize::new(rand::random::<usize>() % 1024),
            topic_last_active: DashMap::new(),
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start background work (idle-topic sweep, endpoint refresh).
    /// Idempotent. Must be called within a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.config.validate_for_publish()?;
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let mut tasks = self.tasks.lock();
        if let Some(lookup) = &self.lookup {
            tasks.push(lookup.spawn_endpoint_refresh());
        }
        let producer = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = producer.cancel.cancelled() => return,
                    _ = sleep(producer.config.sweep_interval) => {}
                }
                producer.sweep_expired().await;
            }
        }));
        info!("producer started");
        Ok(())
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
        }
    }

    /// Publish to a topic; partitioned topics go to their pinned
    /// partition, otherwise any resolved broker is eligible.
    pub async fn publish(&self, topic: &Topic, body: Bytes) -> Result<()> {
        self.publish_inner(topic, ShardingKey::None, body).await
    }

    /// Publish with a sharding key: the partition is selected
    /// deterministically from the key.
    pub async fn publish_sharded(&self, topic: &Topic, key: u64, body: Bytes) -> Result<()> {
        self.publish_inner(topic, ShardingKey::Hash(key), body).await
    }

    async fn publish_inner(&self, topic: &Topic, key: ShardingKey, body: Bytes) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if topic.name.is_empty() {
            return Err(Error::InvalidTopic("topic name is blank".into()));
        }
        if body.is_empty() {
            return Err(Error::InvalidMessage("message body is empty".into()));
        }
        self.total.fetch_add(1, Ordering::Relaxed);

        let key = match topic.partition {
            Some(partition) => ShardingKey::Partition(partition),
            None => key,
        };

        let max_attempts = self.config.publish_max_attempts;
        let mut last: Option<Error> = None;
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = backoff_delay(self.config.publish_retry_base, attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Error::Closed),
                    _ = sleep(delay) => {}
                }
            }
            self.topic_last_active
                .insert(topic.name.clone(), Instant::now());

            let addresses = match self.discovery.resolve(topic, &[key], true).await {
                Ok(addresses) if !addresses.is_empty() => addresses,
                Ok(_) => {
                    self.discovery.invalidate(&topic.name);
                    last = Some(Error::Discovery(format!("no brokers resolved for {topic}")));
                    continue;
                }
                Err(Error::Closed) => return Err(Error::Closed),
                Err(e) => {
                    last = Some(e);
                    continue;
                }
            };

            let Some((address, pooled)) = self.acquire(&addresses).await else {
                // connection-not-found anywhere in the target set:
                // the cached topology is suspect
                self.discovery.invalidate(&topic.name);
                last = Some(Error::Connection(format!(
                    "no connection available for {topic}"
                )));
                continue;
            };

            match self.send_publish(&pooled, topic, body.clone()).await {
                Ok(()) => {
                    self.success.fetch_add(1, Ordering::Relaxed);
                    self.pool.give_back(&address, pooled).await;
                    return Ok(());
                }
                Err(e) if e.is_fatal_publish() => {
                    self.pool.give_back(&address, pooled).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        topic = %topic,
                        address = %address,
                        attempt,
                        error = %e,
                        "publish attempt failed"
                    );
                    self.pool.discard(&address, pooled).await;
                    last = Some(e);
                }
            }
        }
        Err(Error::PublishExhausted {
            attempts: max_attempts,
            last: Box::new(last.unwrap_or_else(|| Error::Connection("no attempt made".into()))),
        })
    }

    /// Borrow a connection, round-robining across the resolved
    /// addresses starting from a rotating offset.
    async fn acquire(&self, addresses: &[Address]) -> Option<(Address, PooledConnection)> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..addresses.len() {
            let address = &addresses[(start + i) % addresses.len()];
            match self.pool.borrow(address).await {
                Ok(pooled) => return Some((address.clone(), pooled)),
                Err(e) => {
                    warn!(address = %address, error = %e, "failed to borrow connection");
                }
            }
        }
        None
    }

    async fn send_publish(
        &self,
        conn: &PooledConnection,
        topic: &Topic,
        body: Bytes,
    ) -> Result<()> {
        // pin the publish to the partition the broker actually serves
        let target = match conn.address().partition {
            Some(partition) => Topic::with_partition(topic.name.clone(), partition),
            None => topic.clone(),
        };
        let frame = conn
            .request(Command::Publish {
                topic: target,
                body,
            })
            .await?;
        match frame {
            Frame::Response(_) => Ok(()),
            Frame::Error(err) => {
                if err.code.invalidates_topology() {
                    self.discovery.invalidate(&topic.name);
                    info!(
                        topic = %topic,
                        code = %err.code,
                        "discovery cache invalidated after broker error"
                    );
                }
                match err.code {
                    BrokerErrorCode::BadTopic => Err(Error::InvalidTopic(topic.name.clone())),
                    BrokerErrorCode::BadMessage => Err(Error::InvalidMessage(err.message)),
                    BrokerErrorCode::TagNotSupported => {
                        Err(Error::TagNotSupported(topic.name.clone()))
                    }
                    _ => Err(Error::Broker(err)),
                }
            }
            Frame::Message(_) => Err(Error::Connection(
                "unexpected message frame in publish response".into(),
            )),
        }
    }

    /// Pre-establish `per_address` pooled connections to every broker
    /// currently serving `topic`.
    pub async fn warm_up(&self, topic: &Topic, per_address: usize) -> Result<()> {
        let addresses = self
            .discovery
            .resolve(topic, &[ShardingKey::None], true)
            .await?;
        for address in &addresses {
            let mut held = Vec::with_capacity(per_address);
            for _ in 0..per_address {
                match self.pool.borrow(address).await {
                    Ok(pooled) => held.push(pooled),
                    Err(e) => {
                        warn!(address = %address, error = %e, "warm-up allocation failed");
                        break;
                    }
                }
            }
            let count = held.len();
            for pooled in held {
                self.pool.give_back(address, pooled).await;
            }
            info!(address = %address, count, "connections warmed");
        }
        Ok(())
    }

    /// Release pooled resources for topics inactive beyond the
    /// configured expiration.
    pub async fn sweep_expired(&self) {
        let expiration = self.config.topic_expiration;
        let expired: Vec<String> = self
            .topic_last_active
            .iter()
            .filter(|entry| entry.value().elapsed() >= expiration)
            .map(|entry| entry.key().clone())
            .collect();
        if expired.is_empty() {
            debug!("no expired topics");
            return;
        }
        for topic in &expired {
            self.topic_last_active.remove(topic);
            self.discovery.invalidate(topic);
        }
        let evicted = self.pool.evict_idle(expiration).await;
        let stats = self.stats();
        info!(
            topics = expired.len(),
            evicted,
            total = stats.total,
            success = stats.success,
            "released resources for expired topics"
        );
    }

    pub async fn close(&self) {
        if !self.started.load(Ordering::SeqCst)
            || self
                .closing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return;
        }
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pool.close_idle().await;
        info!("producer closed");
    }
}

#[async_trait]
impl CompensationPublisher for Producer {
    async fn publish(&self, topic: &Topic, body: Bytes) -> Result<()> {
        Producer::publish(self, topic, body).await
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    // attempt 2 → 2×base, attempt 3 → 4×base, ...
    base * (1u32 << (attempt - 1).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, MemoryConnector, StaticDiscovery};

    fn config() -> Config {
        Config::builder()
            .lookupd_http_address("127.0.0.1:4161")
            .publish_max_attempts(3)
            .publish_retry_base(Duration::from_millis(1))
            .build()
    }

    fn producer(
        config: Config,
    ) -> (Arc<Producer>, Arc<StaticDiscovery>, Arc<MemoryConnector>) {
        let discovery = StaticDiscovery::arc();
        let connector = MemoryConnector::arc();
        let producer = Producer::with_discovery(config, discovery.clone(), connector.clone());
        producer.start().unwrap();
        (producer, discovery, connector)
    }

    #[tokio::test]
    async fn publish_succeeds_and_updates_counters() {
        let (producer, discovery, connector) = producer(config());
        let a = addr("10.0.0.1", 4150);
        discovery.set_topic("orders", vec![a.clone()]);

        producer
            .publish(&Topic::new("orders"), Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let stats = producer.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 1);
        let sent = connector.transports_for(&a)[0].sent();
        assert!(matches!(sent[0], Command::Publish { .. }));
    }

    #[tokio::test]
    async fn publish_fails_over_to_another_broker() {
        let (producer, discovery, connector) = producer(config());
        let a = addr("10.0.0.1", 4150);
        let b = addr("10.0.0.2", 4150);
        discovery.set_topic("orders", vec![a.clone(), b.clone()]);
        connector.refuse(&a);

        producer
            .publish(&Topic::new("orders"), Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(producer.stats().success, 1);
        assert_eq!(connector.transports_for(&b).len(), 1);
    }

    #[tokio::test]
    async fn unreachable_brokers_invalidate_cache_each_attempt() {
        let (producer, discovery, connector) = producer(config());
        let a = addr("10.0.0.1", 4150);
        discovery.set_topic("orders", vec![a.clone()]);
        connector.refuse(&a);

        match producer
            .publish(&Topic::new("orders"), Bytes::from_static(b"payload"))
            .await
        {
            Err(Error::PublishExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        // one invalidation per failed attempt
        assert_eq!(discovery.invalidations(), vec!["orders"; 3]);
        assert_eq!(producer.stats().success, 0);
    }

    #[tokio::test]
    async fn fatal_broker_errors_abort_without_retry() {
        let (producer, discovery, connector) = producer(config());
        let a = addr("10.0.0.1", 4150);
        discovery.set_topic("orders", vec![a.clone()]);

        // warm one pooled connection, then script the error on it
        producer
            .publish(&Topic::new("orders"), Bytes::from_static(b"ok"))
            .await
            .unwrap();
        let resolves_before = discovery.resolve_calls();
        connector.transports_for(&a)[0].fail_next_request("E_BAD_TOPIC no such topic");

        match producer
            .publish(&Topic::new("orders"), Bytes::from_static(b"payload"))
            .await
        {
            Err(Error::InvalidTopic(t)) => assert_eq!(t, "orders"),
            other => panic!("expected InvalidTopic, got {other:?}"),
        }
        assert_eq!(
            discovery.resolve_calls() - resolves_before,
            1,
            "fatal errors must not retry"
        );
        assert!(discovery.invalidations().is_empty());
    }

    #[tokio::test]
    async fn stale_leader_invalidates_cache_and_retries() {
        let (producer, discovery, connector) = producer(config());
        let a = addr("10.0.0.1", 4150);
        discovery.set_topic("orders", vec![a.clone()]);

        producer
            .publish(&Topic::new("orders"), Bytes::from_static(b"ok"))
            .await
            .unwrap();
        connector.transports_for(&a)[0].fail_next_request("E_FAILED_ON_NOT_LEADER re-electing");

        producer
            .publish(&Topic::new("orders"), Bytes::from_static(b"payload"))
            .await
            .unwrap();

        assert_eq!(discovery.invalidations(), vec!["orders"]);
        assert_eq!(producer.stats().success, 2);
        // the bad connection was discarded, a fresh one dialed
        assert_eq!(connector.transports_for(&a).len(), 2);
    }

    #[tokio::test]
    async fn blank_topic_and_empty_body_are_rejected() {
        let (producer, _discovery, _connector) = producer(config());
        assert!(matches!(
            producer.publish(&Topic::new(""), Bytes::from_static(b"x")).await,
            Err(Error::InvalidTopic(_))
        ));
        assert!(matches!(
            producer.publish(&Topic::new("orders"), Bytes::new()).await,
            Err(Error::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn sweep_releases_expired_topics() {
        let mut cfg = config();
        cfg.topic_expiration = Duration::ZERO;
        let (producer, discovery, _connector) = producer(cfg);
        let a = addr("10.0.0.1", 4150);
        discovery.set_topic("orders", vec![a]);

        producer
            .publish(&Topic::new("orders"), Bytes::from_static(b"payload"))
            .await
            .unwrap();
        producer.sweep_expired().await;

        assert!(discovery.invalidations().contains(&"orders".to_string()));
        // second sweep finds nothing left
        producer.sweep_expired().await;
        assert_eq!(
            discovery
                .invalidations()
                .iter()
                .filter(|t| t.as_str() == "orders")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn warm_up_preallocates_pooled_connections() {
        let (producer, discovery, connector) = producer(config());
        let a = addr("10.0.0.1", 4150);
        discovery.set_topic("orders", vec![a.clone()]);

        producer.warm_up(&Topic::new("orders"), 3).await.unwrap();
        assert_eq!(connector.transports_for(&a).len(), 3);

        // warmed connections are reused by publishes
        producer
            .publish(&Topic::new("orders"), Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(connector.transports_for(&a).len(), 3);
    }
}
