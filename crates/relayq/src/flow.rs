//! Ready-credit flow control.
//!
//! Tracks, per topic, the set of subscribed connections and their
//! aggregate ready-credit, drives backoff/resume, and periodically
//! redistributes credit based on observed consumer load. Each topic
//! owns one async mutex serializing its membership and credit
//! mutations; topics proceed independently of each other.
//!
//! Credit updates are asynchronous sends to the connection. The
//! aggregate is corrected only after each individual update is
//! acknowledged, using the observed delta (`new - old`), never an
//! assumed one — a missed or reordered acknowledgement can therefore
//! drift the aggregate but never double-count it, and the periodic
//! proofread bounds the drift.

use crate::config::Config;
use crate::connection::Connection;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use relayq_protocol::Address;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Credit granted to a connection right after its subscribe handshake.
pub const INITIAL_RDY: u32 = 1;

const PROOFREAD_FACTOR_DELTA: f32 = 0.1;
const PROOFREAD_FACTOR_FLOOR: f32 = 0.1;
const PROOFREAD_FACTOR_DEFAULT: f32 = 1.0;

/// Load signals the engine samples from the consumer on every
/// redistribution pass.
pub trait ConsumeInfo: Send + Sync {
    /// Messages queued for consumption per active worker.
    fn load_factor(&self) -> f32;

    /// Whether projected consumption of the queued backlog would
    /// exceed the message timeout budget.
    fn consumption_may_timeout(&self) -> bool;

    /// Per-connection credit ceiling.
    fn rdy_per_connection(&self) -> u32;
}

/// Per-topic subscription state. Mutated only while holding the
/// topic's member lock; one connection belongs to exactly one
/// subscription at a time.
pub struct TopicSubscription {
    topic: String,
    members: Mutex<HashMap<Address, Arc<Connection>>>,
    total_rdy: AtomicI64,
    backed_off: AtomicBool,
    last_proofread: SyncMutex<Instant>,
    proofread_factor: SyncMutex<f32>,
}

impl TopicSubscription {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            members: Mutex::new(HashMap::new()),
            total_rdy: AtomicI64::new(0),
            backed_off: AtomicBool::new(false),
            last_proofread: SyncMutex::new(Instant::now()),
            proofread_factor: SyncMutex::new(PROOFREAD_FACTOR_DEFAULT),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn total_rdy(&self) -> i64 {
        self.total_rdy.load(Ordering::Acquire)
    }

    pub fn is_backed_off(&self) -> bool {
        self.backed_off.load(Ordering::Acquire)
    }

    /// Blind aggregate update from one acknowledged delta. Each blind
    /// update shrinks the proofread factor so recounts come sooner the
    /// more the aggregate has been nudged.
    fn add_total(&self, delta: i64) {
        self.total_rdy.fetch_add(delta, Ordering::AcqRel);
        let mut factor = self.proofread_factor.lock();
        *factor = (*factor - PROOFREAD_FACTOR_DELTA).max(PROOFREAD_FACTOR_FLOOR);
    }

    /// Authoritative overwrite from a recount. Returns the replaced
    /// value when the recount differed; resets the proofread clock and
    /// factor only then.
    fn set_total(&self, recount: i64) -> Option<i64> {
        let recount = recount.max(0);
        let old = self.total_rdy.load(Ordering::Acquire);
        if old == recount {
            return None;
        }
        self.total_rdy.store(recount, Ordering::Release);
        *self.last_proofread.lock() = Instant::now();
        *self.proofread_factor.lock() = PROOFREAD_FACTOR_DEFAULT;
        Some(old)
    }

    fn proofread_due(&self, base_interval: Duration) -> bool {
        let factor = *self.proofread_factor.lock();
        let elapsed = self.last_proofread.lock().elapsed();
        elapsed.as_secs_f64() > base_interval.as_secs_f64() * factor as f64
    }
}

/// Send one credit update and commit its observed delta once the
/// connection acknowledges. Runs detached: a caller that stops waiting
/// does not stop the aggregate correction from landing.
fn spawn_rdy_update(
    sub: Arc<TopicSubscription>,
    conn: Arc<Connection>,
    target: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match conn.set_ready(target).await {
            Ok(delta) => sub.add_total(delta.signed()),
            Err(e) => {
                debug!(
                    topic = %sub.topic(),
                    connection = conn.id(),
                    target,
                    error = %e,
                    "credit update failed"
                );
            }
        }
    })
}

pub struct FlowControlEngine {
    topics: DashMap<String, Arc<TopicSubscription>>,
    info: Arc<dyn ConsumeInfo>,
    rdy_ack_timeout: Duration,
    proofread_interval: Duration,
    redistribute_interval: Duration,
    redistribute_warmup: Duration,
    load_threshold: f32,
    load_water_high: f32,
}

impl FlowControlEngine {
    pub fn new(config: &Config, info: Arc<dyn ConsumeInfo>) -> Self {
        Self {
            topics: DashMap::new(),
            info,
            rdy_ack_timeout: config.rdy_ack_timeout,
            proofread_interval: config.proofread_interval,
            redistribute_interval: config.redistribute_interval,
            redistribute_warmup: config.redistribute_warmup,
            load_threshold: config.load_threshold,
            load_water_high: config.load_water_high,
        }
    }

    fn get(&self, topic: &str) -> Option<Arc<TopicSubscription>> {
        self.topics.get(topic).map(|e| e.value().clone())
    }

    pub fn subscription(&self, topic: &str) -> Option<Arc<TopicSubscription>> {
        self.get(topic)
    }

    pub fn total_rdy(&self, topic: &str) -> i64 {
        self.get(topic).map(|s| s.total_rdy()).unwrap_or(0)
    }

    pub fn is_backed_off(&self, topic: &str) -> bool {
        self.get(topic).map(|s| s.is_backed_off()).unwrap_or(false)
    }

    pub async fn member_count(&self, topic: &str) -> usize {
        match self.get(topic) {
            Some(sub) => sub.members.lock().await.len(),
            None => 0,
        }
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    async fn await_updates(&self, handles: Vec<JoinHandle<()>>, what: &str, topic: &str) {
        if handles.is_empty() {
            return;
        }
        let budget = self.rdy_ack_timeout * handles.len() as u32;
        if timeout(budget, join_all(handles)).await.is_err() {
            // stragglers still apply their observed deltas when they land
            warn!(topic, what, "timed out waiting for credit acknowledgements");
        }
    }

    /// Register a freshly subscribed connection and grant its initial
    /// credit — or drive it to the floor when the topic is backed off.
    pub async fn register(&self, topic: &str, conn: Arc<Connection>, initial_rdy: u32) {
        let sub = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicSubscription::new(topic)))
            .clone();
        let mut members = sub.members.lock().await;
        if let Some(old) = members.insert(conn.address().clone(), conn.clone()) {
            // a stale member at this address would double-count credit
            warn!(topic, address = %conn.address(), "replacing stale subscription member");
            sub.add_total(-(old.current_rdy() as i64));
        }
        let target = if sub.is_backed_off() {
            debug!(topic, connection = conn.id(), "topic backed off, flooring new connection");
            0
        } else {
            initial_rdy
        };
        let handle = spawn_rdy_update(sub.clone(), conn, target);
        let _ = timeout(self.rdy_ack_timeout, handle).await;
        drop(members);
    }

    /// Unregister a connection, subtracting its last-acknowledged
    /// credit from the aggregate. Empty topics are forgotten.
    pub async fn remove_connection(&self, conn: &Arc<Connection>) -> bool {
        let topic = conn.topic().name.clone();
        let Some(sub) = self.get(&topic) else {
            return false;
        };
        let removed;
        {
            let mut members = sub.members.lock().await;
            removed = members.remove(conn.address()).is_some();
            if removed {
                sub.add_total(-(conn.current_rdy() as i64));
            }
            if !members.is_empty() {
                return removed;
            }
        }
        self.topics.remove_if(&topic, |_, s| {
            s.members.try_lock().map(|m| m.is_empty()).unwrap_or(false)
        });
        removed
    }

    /// Transition a topic Active → Backoff and drive every member to
    /// the credit floor. Idempotent: a second call while backed off is
    /// a no-op.
    pub async fn backoff(&self, topic: &str) {
        let Some(sub) = self.get(topic) else {
            info!(topic, "no subscription to back off");
            return;
        };
        let members = sub.members.lock().await;
        if sub
            .backed_off
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(topic, "topic already backed off");
            return;
        }
        info!(topic, members = members.len(), "backing off topic");
        let handles: Vec<_> = members
            .values()
            .map(|conn| spawn_rdy_update(sub.clone(), conn.clone(), 0))
            .collect();
        self.await_updates(handles, "backoff", topic).await;
    }

    /// Transition Backoff → Active and restore every member toward its
    /// expected credit.
    pub async fn resume(&self, topic: &str) {
        let Some(sub) = self.get(topic) else {
            info!(topic, "no subscription to resume");
            return;
        };
        let members = sub.members.lock().await;
        if sub
            .backed_off
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(topic, "topic is not backed off");
            return;
        }
        info!(topic, members = members.len(), "resuming topic");
        let handles: Vec<_> = members
            .values()
            .map(|conn| {
                let target = conn.expected_rdy().max(1);
                spawn_rdy_update(sub.clone(), conn.clone(), target)
            })
            .collect();
        self.await_updates(handles, "resume", topic).await;
    }

    /// One redistribution pass over every topic.
    ///
    /// Low load with no timeout risk grows each member by one toward
    /// `min(available, expected)`; high load with timeout risk shrinks
    /// each member by one, floored at 1. The aggregate never exceeds
    /// `rdy_per_connection × member_count`.
    pub async fn redistribute(&self) {
        let load = self.info.load_factor();
        let may_timeout = self.info.consumption_may_timeout();
        let rdy_per_conn = self.info.rdy_per_connection() as i64;

        let subs: Vec<Arc<TopicSubscription>> =
            self.topics.iter().map(|e| e.value().clone()).collect();
        for sub in subs {
            {
                let members = sub.members.lock().await;
                if !sub.is_backed_off() && !members.is_empty() {
                    let mut handles = Vec::new();
                    if load <= self.load_threshold && !may_timeout {
                        let member_count = members.len() as i64;
                        for conn in members.values() {
                            let current = conn.current_rdy() as i64;
                            let available =
                                rdy_per_conn * member_count - sub.total_rdy() + current;
                            if available <= 0 {
                                continue;
                            }
                            let ceiling = available.min(conn.expected_rdy() as i64);
                            let target = ceiling.min(current + 1);
                            if target > current {
                                handles.push(spawn_rdy_update(
                                    sub.clone(),
                                    conn.clone(),
                                    target as u32,
                                ));
                            }
                        }
                    } else if load >= self.load_water_high && may_timeout {
                        for conn in members.values() {
                            let current = conn.current_rdy();
                            if current > 1 {
                                let target = (current - 1).min(conn.expected_rdy()).max(1);
                                handles.push(spawn_rdy_update(sub.clone(), conn.clone(), target));
                            }
                        }
                    }
                    let topic = sub.topic().to_string();
                    self.await_updates(handles, "redistribute", &topic).await;
                }
            }
            if sub.proofread_due(self.proofread_interval) {
                self.proofread_subscription(&sub).await;
            }
        }
    }

    /// Authoritative recount for one topic; overwrites the tracked
    /// aggregate when the recount is positive and differs.
    pub async fn proofread(&self, topic: &str) {
        if let Some(sub) = self.get(topic) {
            self.proofread_subscription(&sub).await;
        }
    }

    async fn proofread_subscription(&self, sub: &Arc<TopicSubscription>) {
        let members = sub.members.lock().await;
        let recount: i64 = members.values().map(|c| c.current_rdy() as i64).sum();
        if recount > 0 {
            if let Some(old) = sub.set_total(recount) {
                info!(
                    topic = %sub.topic(),
                    old,
                    new = recount,
                    "aggregate credit corrected by proofread"
                );
            }
        }
    }

    /// Forget all subscription state. Used on shutdown after the
    /// connections have been closed.
    pub fn clear(&self) {
        self.topics.clear();
    }

    /// Spawn the periodic redistribution pass: warm-up delay, then a
    /// fixed cadence until cancellation.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(engine.redistribute_warmup) => {}
            }
            debug!("credit redistribution started");
            loop {
                engine.redistribute().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(engine.redistribute_interval) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::testing::{addr, MemoryTransport, StaticLoad};
    use relayq_protocol::Topic;

    fn engine(info: Arc<StaticLoad>) -> FlowControlEngine {
        let config = Config::builder()
            .rdy_ack_timeout(Duration::from_millis(200))
            .build();
        FlowControlEngine::new(&config, info)
    }

    fn connection(id: u64, host: &str) -> (Arc<Connection>, Arc<MemoryTransport>) {
        let transport = MemoryTransport::arc();
        let conn = Arc::new(Connection::new(
            id,
            addr(host, 4150),
            Topic::new("orders"),
            transport.clone(),
            3,
            Duration::from_millis(200),
        ));
        (conn, transport)
    }

    #[tokio::test]
    async fn register_grants_initial_credit_and_tracks_aggregate() {
        let engine = engine(StaticLoad::arc(3));
        let (c1, t1) = connection(1, "10.0.0.1");
        let (c2, t2) = connection(2, "10.0.0.2");

        engine.register("orders", c1.clone(), INITIAL_RDY).await;
        engine.register("orders", c2.clone(), INITIAL_RDY).await;

        assert_eq!(engine.total_rdy("orders"), 2);
        assert_eq!(engine.member_count("orders").await, 2);
        assert_eq!(t1.last_rdy(), Some(1));
        assert_eq!(t2.last_rdy(), Some(1));

        // aggregate equals the sum of member credits after removal too
        engine.remove_connection(&c1).await;
        assert_eq!(engine.total_rdy("orders"), 1);
        engine.remove_connection(&c2).await;
        assert_eq!(engine.member_count("orders").await, 0);
        assert!(engine.subscription("orders").is_none());
    }

    #[tokio::test]
    async fn register_while_backed_off_floors_the_new_connection() {
        let engine = engine(StaticLoad::arc(3));
        let (c1, _t1) = connection(1, "10.0.0.1");
        engine.register("orders", c1, INITIAL_RDY).await;
        engine.backoff("orders").await;

        let (c2, t2) = connection(2, "10.0.0.2");
        engine.register("orders", c2.clone(), INITIAL_RDY).await;
        assert_eq!(t2.last_rdy(), Some(0));
        assert_eq!(c2.current_rdy(), 0);
        assert_eq!(engine.total_rdy("orders"), 0);
    }

    #[tokio::test]
    async fn proofread_corrects_drift() {
        let engine = engine(StaticLoad::arc(3));
        let (c1, _t1) = connection(1, "10.0.0.1");
        engine.register("orders", c1.clone(), INITIAL_RDY).await;

        // manufacture drift: the connection's credit moved without the
        // subscription hearing about it
        c1.set_ready(3).await.unwrap();
        let sub = engine.subscription("orders").unwrap();
        assert_ne!(sub.total_rdy(), 3);

        engine.proofread("orders").await;
        assert_eq!(engine.total_rdy("orders"), 3);
    }
}
