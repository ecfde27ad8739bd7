//! Topology reconciliation.
//!
//! On a fixed cadence (and once at startup) the reconciler diffs the
//! desired broker set — resolved fresh from discovery for every
//! subscribed topic — against the connections currently held, then
//! applies removals strictly before additions. A broker address never
//! carries both an about-to-be-removed and a newly-created connection
//! for the same topic.
//!
//! Every failure here is survivable: broken connections are swept and
//! recreated next cycle, discovery errors defer the topic to the next
//! tick, a failed handshake skips only that address.

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::flow::{FlowControlEngine, INITIAL_RDY};
use crate::lookup::{Discovery, ShardingKey};
use crate::pool::ConnectionPool;
use parking_lot::Mutex;
use relayq_protocol::{Address, Frame, Topic};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sentinel partition meaning "all partitions of the topic".
const ALL_PARTITIONS: i64 = -1;

/// Receiver of freshly subscribed connections. The consumer implements
/// this to spawn the per-connection delivery loop.
pub trait DeliverySink: Send + Sync {
    fn attach(&self, conn: Arc<Connection>, frames: mpsc::Receiver<Frame>);
}

pub struct TopologyReconciler {
    discovery: Arc<dyn Discovery>,
    pool: Arc<ConnectionPool>,
    flow: Arc<FlowControlEngine>,
    delivery: Arc<dyn DeliverySink>,
    /// Topic name → subscribed partition ids ([`ALL_PARTITIONS`] for
    /// whole-topic subscriptions).
    subscriptions: Mutex<HashMap<String, BTreeSet<i64>>>,
    running: AtomicBool,
    closing: CancellationToken,
    channel: String,
    ordered: bool,
    interval: Duration,
    max_retries: u32,
}

impl TopologyReconciler {
    pub fn new(
        config: &Config,
        discovery: Arc<dyn Discovery>,
        pool: Arc<ConnectionPool>,
        flow: Arc<FlowControlEngine>,
        delivery: Arc<dyn DeliverySink>,
        closing: CancellationToken,
    ) -> Self {
        Self {
            discovery,
            pool,
            flow,
            delivery,
            subscriptions: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            closing,
            channel: config.channel.clone(),
            ordered: config.ordered,
            interval: config.reconcile_interval,
            max_retries: config.lookup_max_retries,
        }
    }

    /// Record a topic (or one of its partitions) as subscribed. Takes
    /// effect on the next reconciliation cycle.
    pub fn subscribe(&self, topic: &Topic) {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions
            .entry(topic.name.clone())
            .or_default()
            .insert(topic.partition.unwrap_or(ALL_PARTITIONS));
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// One reconciliation cycle. Overlapping invocations are skipped.
    pub async fn run_once(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconciliation already in progress, skipping this run");
            return Ok(());
        }
        let result = self.reconcile().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn reconcile(&self) -> Result<()> {
        if self.closing.is_cancelled() {
            return Err(Error::Closed);
        }

        // Broken connections go first, regardless of topology changes.
        let mut broken: BTreeSet<Address> = BTreeSet::new();
        for (address, conns) in self.pool.subscription_entries() {
            if conns.iter().any(|c| !c.is_connected()) {
                broken.insert(address);
            }
        }
        for address in &broken {
            warn!(address = %address, "closing broken connection");
            self.drop_address(address).await;
        }

        // Desired address set, resolved fresh per topic.
        let subscriptions = self.subscriptions.lock().clone();
        let mut target: BTreeSet<Address> = BTreeSet::new();
        let mut address_topics: BTreeMap<Address, BTreeSet<String>> = BTreeMap::new();
        for (topic, partitions) in &subscriptions {
            let keys: Vec<ShardingKey> = if partitions.iter().all(|p| *p >= 0) && !partitions.is_empty()
            {
                partitions.iter().map(|p| ShardingKey::Partition(*p)).collect()
            } else {
                vec![ShardingKey::None]
            };
            let addresses = self.resolve_with_retry(topic, &keys).await?;
            for address in addresses {
                address_topics
                    .entry(address.clone())
                    .or_default()
                    .insert(topic.clone());
                target.insert(address);
            }
        }

        let held = self.pool.held_addresses();
        if target.is_empty() && held.is_empty() {
            debug!("no target and no held addresses, nothing to reconcile");
            return Ok(());
        }
        if target.is_empty() {
            warn!(
                held = held.len(),
                "discovery returned no addresses, tearing down held connections"
            );
        }
        debug!(?target, ?held, "reconciling topology");

        // Removals strictly before additions.
        for address in held.difference(&target) {
            info!(address = %address, "removing connection no longer in topology");
            self.drop_address(address).await;
        }

        for address in target.difference(&held) {
            let topics = &address_topics[address];
            if let Err(e) = self.connect_address(address, topics).await {
                warn!(
                    address = %address,
                    error = %e,
                    "failed to establish subscription, will retry next cycle"
                );
                self.drop_address(address).await;
            }
        }
        Ok(())
    }

    async fn resolve_with_retry(&self, topic: &str, keys: &[ShardingKey]) -> Result<Vec<Address>> {
        let query = Topic::new(topic);
        let mut last: Option<Error> = None;
        for attempt in 0..=self.max_retries {
            if self.closing.is_cancelled() {
                return Err(Error::Closed);
            }
            match self.discovery.resolve(&query, keys, false).await {
                Ok(addresses) => return Ok(addresses),
                Err(Error::Closed) => return Err(Error::Closed),
                Err(e) => {
                    warn!(topic, attempt, error = %e, "discovery failed, retrying");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Discovery(format!("no discovery result for {topic}"))))
    }

    /// Create one connection per topic served by `address`, run the
    /// subscribe handshake and register it with flow control at the
    /// initial credit. Any failure unwinds the whole address.
    async fn connect_address(&self, address: &Address, topics: &BTreeSet<String>) -> Result<()> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        info!(address = %address, topics = topics.len(), "establishing subscriptions");
        for name in topics {
            let topic = match address.partition {
                Some(p) => Topic::with_partition(name.clone(), p),
                None => Topic::new(name.clone()),
            };
            let (conn, frames) = self.pool.open_subscribed(address, topic).await?;
            match conn.subscribe(&self.channel, self.ordered).await {
                Ok(()) => {
                    self.delivery.attach(conn.clone(), frames);
                    self.flow.register(name, conn, INITIAL_RDY).await;
                }
                Err(e) => {
                    conn.close().await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Release every connection at an address: unregister from flow
    /// control, then close. Pool resources are freed immediately.
    async fn drop_address(&self, address: &Address) {
        let conns = self.pool.release_subscribed(address);
        for conn in conns {
            self.flow.remove_connection(&conn).await;
            conn.close().await;
        }
    }

    /// Spawn the periodic cycle: once immediately, then on the fixed
    /// cadence. Errors are logged and deferred to the next tick; the
    /// reconciler is never fatal.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = reconciler.run_once().await {
                    warn!(error = %e, "reconciliation cycle failed, waiting for next tick");
                }
                tokio::select! {
                    _ = reconciler.closing.cancelled() => return,
                    _ = sleep(reconciler.interval) => {}
                }
            }
        })
    }
}
