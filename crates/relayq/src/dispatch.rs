//! Message dispatch.
//!
//! A bounded worker pool runs the application handler for every
//! delivered message and picks the post-processing command (FIN, REQ,
//! or nothing) from the handler outcome and the acknowledgement policy.
//! A saturated pool never drops a message: the delivery is requeued
//! with a short delay and the topic is asked to back off.

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::flow::FlowControlEngine;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex as SyncMutex, RwLock};
use relayq_protocol::{Message, Topic};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Failure classification returned by a message handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient business failure: the dispatcher retries once,
    /// synchronously, before treating the message as failed.
    #[error("retryable handler failure: {0}")]
    Retry(String),
    /// Hard business failure: no in-process retry.
    #[error("handler failure: {0}")]
    Fail(String),
}

/// Application-supplied message processing callback.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError>;
}

/// Seam for the compensation path: a failing message that exhausted
/// its requeue budget is republished to its own topic so the queue is
/// never blocked by a poison message and the data is never dropped.
#[async_trait]
pub trait CompensationPublisher: Send + Sync {
    async fn publish(&self, topic: &Topic, body: Bytes) -> Result<()>;
}

/// Dispatch counters. Values are sampled without coordination; they
/// feed logs and the load signals, not accounting.
#[derive(Default)]
pub struct DispatchStats {
    received: AtomicU64,
    success: AtomicU64,
    finished: AtomicU64,
    requeued: AtomicU64,
    queued: AtomicI64,
    active: AtomicUsize,
}

impl DispatchStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Messages submitted but not yet fully processed.
    pub fn queued(&self) -> i64 {
        self.queued.load(Ordering::Relaxed).max(0)
    }

    /// Workers currently running the handler.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Queued-for-consumption per active worker; 0 when idle.
    pub fn load_factor(&self) -> f32 {
        let active = self.active();
        if active == 0 {
            0.0
        } else {
            self.queued() as f32 / active as f32
        }
    }
}

struct Job {
    message: Message,
    conn: Arc<Connection>,
}

struct DispatchInner {
    handler: Arc<dyn Handler>,
    flow: Arc<FlowControlEngine>,
    compensator: Arc<dyn CompensationPublisher>,
    stats: Arc<DispatchStats>,
    auto_finish: bool,
    ordered: bool,
    desired_tag: Option<String>,
    max_requeue_attempts: u16,
    message_timeout: Duration,
    saturation_delay: Duration,
}

impl DispatchInner {
    async fn process(&self, job: Job) {
        let Job { message, conn } = job;
        let start = Instant::now();

        let ok = match self.handler.handle(&message).await {
            Ok(()) => true,
            Err(HandlerError::Retry(reason)) => {
                warn!(id = %message.id, reason, "handler asked for a retry, running once more");
                match self.handler.handle(&message).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(id = %message.id, error = %e, "handler failed on retry");
                        false
                    }
                }
            }
            Err(HandlerError::Fail(reason)) => {
                error!(id = %message.id, reason, "handler failed");
                false
            }
        };

        let elapsed = start.elapsed();
        if elapsed > self.message_timeout {
            warn!(
                id = %message.id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.message_timeout.as_millis() as u64,
                "handler exceeded the message timeout budget"
            );
        }
        if ok {
            self.stats.success.fetch_add(1, Ordering::Relaxed);
        } else {
            conn.mark_failure();
        }

        self.finalize(&message, &conn, ok).await;
    }

    /// Pick and send the post-processing command.
    async fn finalize(&self, message: &Message, conn: &Arc<Connection>, ok: bool) {
        if !self.auto_finish {
            // Manual mode: the application owns acknowledgement. The
            // SDK only requeues an explicitly marked failure.
            if !ok {
                if let Some(delay) = message.next_consume_delay {
                    self.send_requeue(message, conn, delay).await;
                }
            }
            return;
        }

        if ok {
            self.send_finish(message, conn).await;
            return;
        }

        if !self.ordered && message.attempts > self.max_requeue_attempts {
            info!(
                id = %message.id,
                attempts = message.attempts,
                limit = self.max_requeue_attempts,
                "requeue budget exhausted, publishing compensation copy"
            );
            match self
                .compensator
                .publish(conn.topic(), message.body.clone())
                .await
            {
                Ok(()) => self.send_finish(message, conn).await,
                Err(e) => {
                    // leave the message unacknowledged; the broker
                    // redelivers and compensation is attempted again
                    error!(id = %message.id, error = %e, "compensation publish failed");
                }
            }
            return;
        }

        match message.next_consume_delay {
            Some(delay) => self.send_requeue(message, conn, delay).await,
            None => {
                // Withhold FIN and shrink the local credit target; the
                // broker-side message timeout is expected to requeue.
                // Timing-dependent under clock skew — kept as designed.
                conn.decline_expected_rdy();
                info!(
                    id = %message.id,
                    connection = conn.id(),
                    "withholding acknowledgement, relying on broker timeout redelivery"
                );
            }
        }
    }

    async fn send_finish(&self, message: &Message, conn: &Arc<Connection>) {
        match conn.finish(message.id).await {
            Ok(()) => {
                self.stats.finished.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(id = %message.id, error = %e, "failed to send FIN, message will be redelivered");
            }
        }
    }

    async fn send_requeue(&self, message: &Message, conn: &Arc<Connection>, delay: Duration) {
        match conn.requeue(message.id, delay).await {
            Ok(()) => {
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                debug!(id = %message.id, delay_ms = delay.as_millis() as u64, "message requeued");
            }
            Err(e) => {
                warn!(id = %message.id, error = %e, "failed to send REQ, message will be redelivered");
            }
        }
    }
}

pub struct Dispatcher {
    inner: Arc<DispatchInner>,
    tx: RwLock<Option<mpsc::Sender<Job>>>,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        handler: Arc<dyn Handler>,
        flow: Arc<FlowControlEngine>,
        compensator: Arc<dyn CompensationPublisher>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        let inner = Arc::new(DispatchInner {
            handler,
            flow,
            compensator,
            stats,
            auto_finish: config.auto_finish,
            ordered: config.ordered,
            desired_tag: config.desired_tag.clone(),
            max_requeue_attempts: config.max_requeue_attempts,
            message_timeout: config.message_timeout,
            saturation_delay: config.saturation_requeue_delay,
        });

        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(config.worker_count);
        for worker in 0..config.worker_count.max(1) {
            let rx = rx.clone();
            let inner = inner.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    inner.stats.active.fetch_add(1, Ordering::Relaxed);
                    inner.process(job).await;
                    inner.stats.active.fetch_sub(1, Ordering::Relaxed);
                    inner.stats.queued.fetch_sub(1, Ordering::Relaxed);
                }
                debug!(worker, "dispatcher worker exited");
            }));
        }

        Self {
            inner,
            tx: RwLock::new(Some(tx)),
            workers: SyncMutex::new(workers),
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.inner.stats.clone()
    }

    /// Route one delivery into the worker pool.
    ///
    /// Applies the tag filter and, on ordered topics, the sequence
    /// check — an out-of-order delivery is rejected upstream without
    /// closing the connection. A full queue requeues the message with
    /// the saturation delay and backs the topic off.
    pub async fn submit(&self, message: Message, conn: Arc<Connection>) -> Result<()> {
        self.inner.stats.received.fetch_add(1, Ordering::Relaxed);

        if let Some(desired) = &self.inner.desired_tag {
            if message.tag.as_deref() != Some(desired.as_str()) {
                warn!(
                    id = %message.id,
                    tag = ?message.tag,
                    desired = %desired,
                    "skipping message without desired tag"
                );
                return Ok(());
            }
        }

        if self.inner.ordered {
            let sequence = message.sequence.ok_or_else(|| Error::OrderViolation {
                connection_id: conn.id(),
                detail: "delivery without sequence state in ordered mode".into(),
            })?;
            if !conn.check_order(sequence) {
                return Err(Error::OrderViolation {
                    connection_id: conn.id(),
                    detail: format!(
                        "sequence ({}, {}) does not advance the watermark",
                        sequence.internal_id, sequence.offset
                    ),
                });
            }
        }

        conn.touch_message();

        let sender = self.tx.read().clone();
        let Some(sender) = sender else {
            return Err(Error::Closed);
        };
        match sender.try_send(Job {
            message,
            conn: conn.clone(),
        }) {
            Ok(()) => {
                self.inner.stats.queued.fetch_add(1, Ordering::Relaxed);
                if !self.inner.ordered {
                    conn.increase_expected_rdy();
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job))
            | Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(
                    id = %job.message.id,
                    topic = %job.conn.topic(),
                    "worker pool saturated, requeueing and backing off topic"
                );
                if let Err(e) = job
                    .conn
                    .requeue(job.message.id, self.inner.saturation_delay)
                    .await
                {
                    error!(id = %job.message.id, error = %e, "failed to requeue after saturation");
                } else {
                    self.inner.stats.requeued.fetch_add(1, Ordering::Relaxed);
                }
                self.inner.flow.backoff(&job.conn.topic().name).await;
                Err(Error::WorkerSaturated)
            }
        }
    }

    /// Stop accepting work, give in-flight handlers `grace` to finish,
    /// then abort what is left.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.tx.write().take();
        let mut workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        if timeout(grace, join_all(workers.iter_mut())).await.is_err() {
            warn!("shutdown grace elapsed, aborting in-flight dispatcher work");
            for worker in &workers {
                worker.abort();
            }
        }
    }
}
