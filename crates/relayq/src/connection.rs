//! One subscribed (or pooled) link to one broker for one topic.
//!
//! The connection tracks the credit the broker has last acknowledged
//! (`current_rdy`), the credit the flow-control engine is working
//! toward (`expected_rdy`), the last delivery timestamp, and the
//! ordered-mode sequence watermark. All lifecycle changes go through
//! [`ConnectionPool`](crate::pool::ConnectionPool); the reconciler and
//! flow engine only hold references.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use relayq_protocol::{Address, Command, Frame, MessageId, Sequence, Topic, Transport};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Observed result of one acknowledged credit update. The aggregate is
/// always corrected with `new - old`, never an assumed delta, so a
/// missed or reordered update cannot double-count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdyDelta {
    pub old: u32,
    pub new: u32,
}

impl RdyDelta {
    pub fn signed(&self) -> i64 {
        self.new as i64 - self.old as i64
    }
}

pub struct Connection {
    id: u64,
    address: Address,
    topic: Topic,
    transport: Arc<dyn Transport>,
    current_rdy: AtomicU32,
    expected_rdy: AtomicU32,
    /// Ceiling for `expected_rdy` growth (`rdy_per_connection`).
    max_rdy: u32,
    last_message_at: Mutex<Option<Instant>>,
    last_failure_at: Mutex<Option<Instant>>,
    /// Highest accepted (internal id, offset) pair in ordered mode.
    order_watermark: Mutex<Option<Sequence>>,
    query_timeout: Duration,
}

impl Connection {
    pub fn new(
        id: u64,
        address: Address,
        topic: Topic,
        transport: Arc<dyn Transport>,
        max_rdy: u32,
        query_timeout: Duration,
    ) -> Self {
        Self {
            id,
            address,
            topic,
            transport,
            current_rdy: AtomicU32::new(0),
            expected_rdy: AtomicU32::new(1),
            max_rdy: max_rdy.max(1),
            last_message_at: Mutex::new(None),
            last_failure_at: Mutex::new(None),
            order_watermark: Mutex::new(None),
            query_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn current_rdy(&self) -> u32 {
        self.current_rdy.load(Ordering::Acquire)
    }

    pub fn expected_rdy(&self) -> u32 {
        self.expected_rdy.load(Ordering::Acquire)
    }

    /// Grow the target credit by one, capped at the per-connection
    /// ceiling. Called as messages flow so a healthy connection earns
    /// its way up from the initial grant.
    pub fn increase_expected_rdy(&self) {
        let _ = self
            .expected_rdy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v < self.max_rdy {
                    Some(v + 1)
                } else {
                    None
                }
            });
    }

    /// Lower the target credit, floored at 1 so the connection can
    /// always make progress again.
    ///
    /// Used on the no-FIN path: the broker is expected to time the
    /// message out and redeliver, so we only shrink the local target.
    pub fn decline_expected_rdy(&self) {
        let _ = self
            .expected_rdy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v > 1 {
                    Some(v - 1)
                } else {
                    None
                }
            });
    }

    /// Send RDY and, once the transport acknowledges the write, commit
    /// the new credit locally. Returns the observed delta for aggregate
    /// accounting.
    pub async fn set_ready(&self, count: u32) -> Result<RdyDelta> {
        self.transport.send(Command::Ready { count }).await?;
        let old = self.current_rdy.swap(count, Ordering::AcqRel);
        Ok(RdyDelta { old, new: count })
    }

    /// Drive credit to the floor (RDY 0): full stop for this link.
    pub async fn drive_to_floor(&self) -> Result<RdyDelta> {
        self.set_ready(0).await
    }

    /// Restore credit toward the expected target, at least 1.
    pub async fn restore(&self) -> Result<RdyDelta> {
        self.set_ready(self.expected_rdy().max(1)).await
    }

    /// Round-trip a command, bounded by the query timeout.
    pub async fn request(&self, command: Command) -> Result<Frame> {
        let name = command.name();
        let frame = tokio::time::timeout(self.query_timeout, self.transport.request(command))
            .await
            .map_err(|_| Error::Timeout(format!("{name} round-trip to {}", self.address)))??;
        Ok(frame)
    }

    /// Perform the subscribe handshake for this connection's topic.
    pub async fn subscribe(&self, channel: &str, ordered: bool) -> Result<()> {
        let command = if ordered {
            Command::SubscribeOrdered {
                topic: self.topic.clone(),
                channel: channel.to_string(),
            }
        } else {
            Command::Subscribe {
                topic: self.topic.clone(),
                channel: channel.to_string(),
            }
        };
        match self.request(command).await? {
            Frame::Response(_) => Ok(()),
            Frame::Error(err) => Err(Error::Broker(err)),
            Frame::Message(_) => Err(Error::Connection(format!(
                "unexpected message frame during handshake with {}",
                self.address
            ))),
        }
    }

    pub async fn finish(&self, id: MessageId) -> Result<()> {
        self.transport.send(Command::Finish { id }).await?;
        Ok(())
    }

    pub async fn requeue(&self, id: MessageId, delay: Duration) -> Result<()> {
        self.transport.send(Command::Requeue { id, delay }).await?;
        Ok(())
    }

    /// Answer a broker heartbeat probe.
    pub async fn nop(&self) -> Result<()> {
        self.transport.send(Command::Nop).await?;
        Ok(())
    }

    /// Heartbeat probe. `true` when the broker accepted the NOP within
    /// the query timeout.
    pub async fn validate_heartbeat(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        matches!(
            tokio::time::timeout(self.query_timeout, self.transport.send(Command::Nop)).await,
            Ok(Ok(()))
        )
    }

    /// Clean close: CLOSE handshake best-effort, then transport
    /// teardown. Never fails.
    pub async fn close(&self) {
        if self.is_connected() {
            let attempt =
                tokio::time::timeout(self.query_timeout, self.transport.request(Command::Close))
                    .await;
            if let Ok(Err(e)) = attempt {
                debug!(connection = self.id, error = %e, "close handshake failed");
            }
        }
        self.transport.close().await;
    }

    /// Accept `sequence` iff it advances strictly past the watermark.
    /// The first delivery on a connection always passes.
    pub fn check_order(&self, sequence: Sequence) -> bool {
        let mut watermark = self.order_watermark.lock();
        match *watermark {
            Some(last)
                if sequence.internal_id <= last.internal_id || sequence.offset <= last.offset =>
            {
                false
            }
            _ => {
                *watermark = Some(sequence);
                true
            }
        }
    }

    pub fn touch_message(&self) {
        *self.last_message_at.lock() = Some(Instant::now());
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        *self.last_message_at.lock()
    }

    pub fn mark_failure(&self) {
        *self.last_failure_at.lock() = Some(Instant::now());
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("topic", &self.topic)
            .field("current_rdy", &self.current_rdy())
            .field("expected_rdy", &self.expected_rdy())
            .finish()
    }
}
