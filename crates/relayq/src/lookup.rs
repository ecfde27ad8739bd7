//! Directory service (lookupd) client.
//!
//! Resolves topic + partition to broker addresses over the lookupd HTTP
//! contract, round-robining across the configured endpoints, caching
//! results per topic, and refreshing the endpoint list itself on a
//! jittered interval via `/listlookup`.
//!
//! The rest of the SDK consumes this through the [`Discovery`] trait so
//! the reconciler and publisher can be exercised against scripted
//! topologies in tests.

use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use relayq_protocol::{Address, Topic};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DIRECTORY_ACCEPT_HEADER: &str = "application/vnd.relayq; version=1.0";

/// Selector for which partition addresses a resolve should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingKey {
    /// No sharding: every partition, plus unpartitioned entries.
    None,
    /// One specific partition.
    Partition(i64),
    /// Hash-selected partition, used by sharded publishes.
    Hash(u64),
}

/// Topology resolution seam consumed by the reconciler and publisher.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Resolve a topic to broker addresses. `for_write` selects the
    /// directory's writable view.
    async fn resolve(
        &self,
        topic: &Topic,
        keys: &[ShardingKey],
        for_write: bool,
    ) -> Result<Vec<Address>>;

    /// Drop any cached result for `topic`; the next resolve goes back
    /// to the directory.
    fn invalidate(&self, topic: &str);
}

/// Result of one directory query for a topic.
#[derive(Debug, Clone)]
pub struct PartitionMap {
    pub topic: String,
    /// Partition id → broker address.
    pub partitioned: BTreeMap<i64, Address>,
    /// Legacy entries with no partition id. Never contains a duplicate
    /// of a partitioned address.
    pub unpartitioned: Vec<Address>,
    fetched_at: Instant,
}

impl PartitionMap {
    pub fn is_empty(&self) -> bool {
        self.partitioned.is_empty() && self.unpartitioned.is_empty()
    }

    fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Apply sharding selectors, deduplicating and ordering the result
    /// so topology diffs are deterministic.
    pub fn select(&self, keys: &[ShardingKey]) -> Vec<Address> {
        let mut out: BTreeSet<Address> = BTreeSet::new();
        for key in keys {
            match key {
                ShardingKey::None => {
                    out.extend(self.partitioned.values().cloned());
                    out.extend(self.unpartitioned.iter().cloned());
                }
                ShardingKey::Partition(id) => {
                    if let Some(addr) = self.partitioned.get(id) {
                        out.insert(addr.clone());
                    }
                }
                ShardingKey::Hash(hash) => {
                    if self.partitioned.is_empty() {
                        out.extend(self.unpartitioned.iter().cloned());
                    } else {
                        let idx = (hash % self.partitioned.len() as u64) as usize;
                        if let Some(addr) = self.partitioned.values().nth(idx) {
                            out.insert(addr.clone());
                        }
                    }
                }
            }
        }
        out.into_iter().collect()
    }
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    partitions: BTreeMap<String, ProducerEntry>,
    #[serde(default)]
    producers: Vec<ProducerEntry>,
}

#[derive(Deserialize)]
struct ProducerEntry {
    broadcast_address: String,
    tcp_port: u16,
    #[serde(default)]
    version: String,
}

impl ProducerEntry {
    fn to_address(&self) -> Address {
        let mut addr = Address::new(self.broadcast_address.clone(), self.tcp_port);
        addr.version = self.version.clone();
        addr
    }
}

#[derive(Deserialize)]
struct ListLookupResponse {
    #[serde(default)]
    lookupdnodes: Vec<LookupdNode>,
}

#[derive(Deserialize)]
struct LookupdNode {
    #[serde(rename = "NodeIP")]
    node_ip: String,
    #[serde(rename = "HttpPort")]
    http_port: u16,
}

/// Parse a `/lookup` response body.
///
/// Negative partition ids are ignored; producers that duplicate a
/// partitioned address are excluded from the unpartitioned list.
pub(crate) fn parse_partition_map(topic: &str, body: &[u8]) -> Result<PartitionMap> {
    let response: LookupResponse = serde_json::from_slice(body)?;

    let mut partitioned = BTreeMap::new();
    let mut partition_set = BTreeSet::new();
    for (id_text, entry) in &response.partitions {
        let id: i64 = id_text
            .parse()
            .map_err(|_| Error::Discovery(format!("bad partition id {id_text:?} for {topic}")))?;
        if id < 0 {
            continue;
        }
        let addr = entry.to_address().with_partition(id);
        partition_set.insert(Address::new(addr.host.clone(), addr.port));
        partitioned.insert(id, addr);
    }

    let mut unpartitioned = Vec::new();
    for entry in &response.producers {
        let addr = entry.to_address();
        if !partition_set.contains(&addr) {
            unpartitioned.push(addr);
        }
    }

    Ok(PartitionMap {
        topic: topic.to_string(),
        partitioned,
        unpartitioned,
        fetched_at: Instant::now(),
    })
}

/// Parse a `/listlookup` response body into sorted `host:port` strings.
pub(crate) fn parse_lookupd_nodes(body: &[u8]) -> Result<Vec<String>> {
    let response: ListLookupResponse = serde_json::from_slice(body)?;
    let mut nodes: Vec<String> = response
        .lookupdnodes
        .iter()
        .map(|n| format!("{}:{}", n.node_ip, n.http_port))
        .collect();
    nodes.sort();
    nodes.dedup();
    Ok(nodes)
}

fn base_url(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    }
}

/// HTTP client for the lookupd directory service.
pub struct LookupClient {
    http: reqwest::Client,
    endpoints: RwLock<Vec<String>>,
    cursor: AtomicUsize,
    cache: dashmap::DashMap<String, Arc<PartitionMap>>,
    cache_ttl: Duration,
    max_retries: u32,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl LookupClient {
    pub fn new(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            endpoints: RwLock::new(config.lookupd_http_addresses.clone()),
            // start at a random position so a fleet of clients does not
            // hammer the first endpoint in unison
            cursor: AtomicUsize::new(rand::random::<usize>() % 128),
            cache: dashmap::DashMap::new(),
            cache_ttl: config.reconcile_interval,
            max_retries: config.lookup_max_retries,
            poll_interval: config.lookup_poll_interval,
            cancel,
        })
    }

    /// Current endpoint list (refreshed copies swap in atomically).
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.read().clone()
    }

    /// Advance the round-robin cursor and return the endpoint to use.
    /// The cursor moves on every call, including ones whose request
    /// later fails, to spread load evenly.
    fn next_endpoint(&self) -> Option<String> {
        let endpoints = self.endpoints.read();
        if endpoints.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Some(endpoints[idx].clone())
    }

    async fn fetch_partition_map(&self, topic: &str, writable: bool) -> Result<PartitionMap> {
        let endpoint = self
            .next_endpoint()
            .ok_or_else(|| Error::Discovery("no lookupd endpoints configured".into()))?;
        let url = format!(
            "{}/lookup?topic={}&access={}",
            base_url(&endpoint),
            topic,
            if writable { "w" } else { "r" }
        );
        debug!(url = %url, "querying directory service");
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, DIRECTORY_ACCEPT_HEADER)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Discovery(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body = response.bytes().await?;
        parse_partition_map(topic, &body)
    }

    /// Fetch (or serve from cache) the partition map for a topic.
    ///
    /// The cache TTL is bounded by the reconcile interval so one cached
    /// result can never feed two reconciliation rounds.
    pub async fn partition_map(&self, topic: &str, for_write: bool) -> Result<Arc<PartitionMap>> {
        if let Some(hit) = self.cache.get(topic) {
            if hit.age() < self.cache_ttl {
                return Ok(hit.clone());
            }
        }

        let mut last: Option<Error> = None;
        for attempt in 0..=self.max_retries {
            if self.cancel.is_cancelled() {
                return Err(Error::Closed);
            }
            match self.fetch_partition_map(topic, for_write).await {
                Ok(map) => {
                    let map = Arc::new(map);
                    self.cache.insert(topic.to_string(), map.clone());
                    return Ok(map);
                }
                Err(e) => {
                    warn!(topic, attempt, error = %e, "lookup attempt failed, rotating endpoint");
                    last = Some(e);
                }
            }
        }
        Err(Error::Discovery(format!(
            "lookup for {} failed after {} attempts: {}",
            topic,
            self.max_retries + 1,
            last.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Replace the endpoint list from `/listlookup`. A failed or empty
    /// poll keeps the previous list.
    pub async fn refresh_endpoints(&self) -> Result<()> {
        let endpoint = self
            .next_endpoint()
            .ok_or_else(|| Error::Discovery("no lookupd endpoints configured".into()))?;
        let url = format!("{}/listlookup", base_url(&endpoint));
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, DIRECTORY_ACCEPT_HEADER)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Discovery(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body = response.bytes().await?;
        let nodes = parse_lookupd_nodes(&body)?;
        if nodes.is_empty() {
            debug!("directory returned no lookupd nodes, keeping previous list");
            return Ok(());
        }
        let count = nodes.len();
        *self.endpoints.write() = nodes;
        debug!(count, "directory endpoint list replaced");
        Ok(())
    }

    /// Spawn the periodic endpoint refresh: a jittered initial delay,
    /// then a fixed cadence until cancellation.
    pub fn spawn_endpoint_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let initial = {
                use rand::Rng;
                let max = client.poll_interval.as_secs().max(1);
                Duration::from_secs(rand::thread_rng().gen_range(0..max))
            };
            tokio::select! {
                _ = client.cancel.cancelled() => return,
                _ = sleep(initial) => {}
            }
            info!("directory endpoint refresh started");
            loop {
                if let Err(e) = client.refresh_endpoints().await {
                    warn!(error = %e, "endpoint refresh failed, keeping previous list");
                }
                tokio::select! {
                    _ = client.cancel.cancelled() => return,
                    _ = sleep(client.poll_interval) => {}
                }
            }
        })
    }
}

#[async_trait]
impl Discovery for LookupClient {
    async fn resolve(
        &self,
        topic: &Topic,
        keys: &[ShardingKey],
        for_write: bool,
    ) -> Result<Vec<Address>> {
        let map = self.partition_map(&topic.name, for_write).await?;
        Ok(map.select(keys))
    }

    fn invalidate(&self, topic: &str) {
        if self.cache.remove(topic).is_some() {
            info!(topic, "discovery cache invalidated");
        }
    }
}
