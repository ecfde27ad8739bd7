//! Address-keyed connection pooling.
//!
//! The pool is the only place connections are created or destroyed;
//! the reconciler and flow-control engine hold references and route
//! every lifecycle change through here.
//!
//! Two kinds of ownership live side by side:
//! - **subscriptions** — connections the reconciler opened for
//!   consuming. One connection per (address, topic); owned by the pool
//!   until the address is released.
//! - **shards** — lend/return pools the publisher borrows from, one
//!   per broker address with a per-address cap. A borrowed connection
//!   is validated on borrow and evicted instead of returned once its
//!   link is broken.

use crate::connection::Connection;
use crate::error::{Error, Result};
use dashmap::DashMap;
use relayq_protocol::{Address, Connector, Frame, Topic};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

struct IdleConnection {
    conn: Arc<Connection>,
    last_used: Instant,
}

struct PoolShard {
    idle: Mutex<Vec<IdleConnection>>,
    permits: Arc<Semaphore>,
}

impl PoolShard {
    fn new(cap: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(cap.max(1))),
        }
    }
}

/// A connection borrowed from the publisher side of the pool. Holds the
/// per-address permit for as long as the caller keeps it.
pub struct PooledConnection {
    conn: Arc<Connection>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.conn.id())
            .field("address", self.conn.address())
            .finish()
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    next_id: AtomicU64,
    rdy_per_connection: u32,
    query_timeout: Duration,
    per_address_cap: usize,
    subscriptions: DashMap<Address, Vec<Arc<Connection>>>,
    shards: DashMap<Address, Arc<PoolShard>>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        rdy_per_connection: u32,
        query_timeout: Duration,
        per_address_cap: usize,
    ) -> Self {
        Self {
            connector,
            next_id: AtomicU64::new(1),
            rdy_per_connection,
            query_timeout,
            per_address_cap: per_address_cap.max(1),
            subscriptions: DashMap::new(),
            shards: DashMap::new(),
        }
    }

    async fn dial(&self, address: &Address, topic: Topic) -> Result<(Arc<Connection>, mpsc::Receiver<Frame>)> {
        let (transport, frames) = self
            .connector
            .connect(address)
            .await
            .map_err(|e| Error::Connection(format!("failed to connect to {address}: {e}")))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            id,
            address.clone(),
            topic,
            transport,
            self.rdy_per_connection,
            self.query_timeout,
        ));
        Ok((conn, frames))
    }

    // ------------------------------------------------------------------
    // Subscriber side
    // ------------------------------------------------------------------

    /// Open a consuming connection to `address` for `topic` and take
    /// ownership of it. The caller performs the subscribe handshake.
    pub async fn open_subscribed(
        &self,
        address: &Address,
        topic: Topic,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Frame>)> {
        let (conn, frames) = self.dial(address, topic).await?;
        self.subscriptions
            .entry(address.clone())
            .or_default()
            .push(conn.clone());
        Ok((conn, frames))
    }

    /// Addresses currently holding at least one subscribed connection.
    pub fn held_addresses(&self) -> BTreeSet<Address> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of all subscribed connections grouped by address.
    pub fn subscription_entries(&self) -> Vec<(Address, Vec<Arc<Connection>>)> {
        self.subscriptions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn subscribed_connections(&self) -> Vec<Arc<Connection>> {
        self.subscriptions
            .iter()
            .flat_map(|e| e.value().clone())
            .collect()
    }

    /// Detach and return every subscribed connection at `address`. The
    /// caller unregisters and closes them; the pool forgets the address
    /// immediately so a reconnect can start fresh.
    pub fn release_subscribed(&self, address: &Address) -> Vec<Arc<Connection>> {
        self.subscriptions
            .remove(address)
            .map(|(_, conns)| conns)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Publisher side
    // ------------------------------------------------------------------

    fn shard(&self, address: &Address) -> Arc<PoolShard> {
        self.shards
            .entry(address.clone())
            .or_insert_with(|| Arc::new(PoolShard::new(self.per_address_cap)))
            .clone()
    }

    /// Borrow a connection to `address`, reusing an idle one when it is
    /// still connected and dialing otherwise. Does not block when the
    /// per-address cap is reached.
    pub async fn borrow(&self, address: &Address) -> Result<PooledConnection> {
        let shard = self.shard(address);
        let permit = shard
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::PoolExhausted(address.to_string()))?;

        loop {
            let idle = { shard.idle.lock().await.pop() };
            match idle {
                Some(entry) if entry.conn.is_connected() => {
                    return Ok(PooledConnection {
                        conn: entry.conn,
                        _permit: permit,
                    });
                }
                Some(entry) => {
                    debug!(address = %address, connection = entry.conn.id(), "evicting broken idle connection");
                    entry.conn.close().await;
                }
                None => break,
            }
        }

        let (conn, _frames) = self.dial(address, Topic::new("")).await?;
        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    /// Return a borrowed connection. Broken links and overflow beyond
    /// the per-address cap are closed instead of pooled.
    pub async fn give_back(&self, address: &Address, pooled: PooledConnection) {
        let PooledConnection { conn, _permit } = pooled;
        if !conn.is_connected() {
            conn.close().await;
            return;
        }
        let shard = self.shard(address);
        let mut idle = shard.idle.lock().await;
        if idle.len() < self.per_address_cap {
            idle.push(IdleConnection {
                conn,
                last_used: Instant::now(),
            });
        } else {
            drop(idle);
            conn.close().await;
        }
    }

    /// Destroy a borrowed connection that misbehaved.
    pub async fn discard(&self, address: &Address, pooled: PooledConnection) {
        let PooledConnection { conn, _permit } = pooled;
        warn!(address = %address, connection = conn.id(), "discarding connection");
        conn.close().await;
    }

    /// Close idle publisher connections unused for longer than
    /// `max_idle`. Returns how many were evicted.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let shards: Vec<Arc<PoolShard>> = self.shards.iter().map(|e| e.value().clone()).collect();
        let mut evicted = Vec::new();
        for shard in shards {
            let mut idle = shard.idle.lock().await;
            let mut keep = Vec::with_capacity(idle.len());
            for entry in idle.drain(..) {
                if entry.last_used.elapsed() >= max_idle || !entry.conn.is_connected() {
                    evicted.push(entry.conn);
                } else {
                    keep.push(entry);
                }
            }
            *idle = keep;
        }
        let count = evicted.len();
        for conn in evicted {
            conn.close().await;
        }
        count
    }

    /// Close every idle publisher connection. Subscribed connections
    /// are closed by their owner via [`release_subscribed`].
    ///
    /// [`release_subscribed`]: ConnectionPool::release_subscribed
    pub async fn close_idle(&self) {
        self.evict_idle(Duration::ZERO).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, MemoryConnector};
    use relayq_protocol::Transport;

    fn pool(connector: Arc<MemoryConnector>, cap: usize) -> ConnectionPool {
        ConnectionPool::new(connector, 3, Duration::from_millis(200), cap)
    }

    #[tokio::test]
    async fn borrow_reuses_returned_connections() {
        let connector = MemoryConnector::arc();
        let pool = pool(connector.clone(), 2);
        let a = addr("10.0.0.1", 4150);

        let first = pool.borrow(&a).await.unwrap();
        assert_eq!(connector.dial_count(), 1);
        pool.give_back(&a, first).await;

        let second = pool.borrow(&a).await.unwrap();
        assert_eq!(connector.dial_count(), 1, "idle connection must be reused");
        pool.give_back(&a, second).await;
    }

    #[tokio::test]
    async fn borrow_respects_per_address_cap() {
        let connector = MemoryConnector::arc();
        let pool = pool(connector, 2);
        let a = addr("10.0.0.1", 4150);

        let _c1 = pool.borrow(&a).await.unwrap();
        let _c2 = pool.borrow(&a).await.unwrap();
        match pool.borrow(&a).await {
            Err(Error::PoolExhausted(_)) => {}
            other => panic!("expected PoolExhausted, got {other:?}"),
        }
        drop(_c1);
        // permit released on drop, borrow works again
        let _c3 = pool.borrow(&a).await.unwrap();
    }

    #[tokio::test]
    async fn broken_idle_connection_is_replaced() {
        let connector = MemoryConnector::arc();
        let pool = pool(connector.clone(), 2);
        let a = addr("10.0.0.1", 4150);

        let first = pool.borrow(&a).await.unwrap();
        connector.transports_for(&a)[0].disconnect();
        // broken on return: closed, not pooled
        pool.give_back(&a, first).await;

        let _second = pool.borrow(&a).await.unwrap();
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test]
    async fn evict_idle_closes_stale_connections() {
        let connector = MemoryConnector::arc();
        let pool = pool(connector.clone(), 2);
        let a = addr("10.0.0.1", 4150);

        let c = pool.borrow(&a).await.unwrap();
        pool.give_back(&a, c).await;
        assert_eq!(pool.evict_idle(Duration::ZERO).await, 1);
        assert!(!connector.transports_for(&a)[0].is_connected());
    }

    #[tokio::test]
    async fn subscribed_connections_are_owned_until_released() {
        let connector = MemoryConnector::arc();
        let pool = pool(connector, 2);
        let a = addr("10.0.0.1", 4150);
        let b = addr("10.0.0.2", 4150);

        let (_c1, _rx1) = pool
            .open_subscribed(&a, Topic::new("orders"))
            .await
            .unwrap();
        let (_c2, _rx2) = pool
            .open_subscribed(&b, Topic::new("orders"))
            .await
            .unwrap();

        let held = pool.held_addresses();
        assert_eq!(held.len(), 2);
        assert!(held.contains(&a));

        let released = pool.release_subscribed(&a);
        assert_eq!(released.len(), 1);
        assert_eq!(pool.held_addresses().len(), 1);
        assert!(pool.release_subscribed(&a).is_empty());
    }
}
