//! SDK configuration.
//!
//! One [`Config`] covers both the subscriber and publisher paths.
//! Every knob has a production default; the builder only needs the
//! directory endpoints and (for consumers) a channel name.
//!
//! # Example
//!
//! ```rust,ignore
//! use relayq::Config;
//!
//! let config = Config::builder()
//!     .lookupd_http_addresses(vec!["10.0.0.5:4161".to_string()])
//!     .channel("billing")
//!     .rdy_per_connection(4)
//!     .build();
//! ```

use crate::error::{Error, Result};
use std::time::Duration;

/// Configuration shared by [`Consumer`](crate::Consumer) and
/// [`Producer`](crate::Producer).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory service (lookupd) HTTP endpoints, `host:port`.
    pub lookupd_http_addresses: Vec<String>,
    /// Channel the consumer subscribes on. Required for consuming.
    pub channel: String,
    /// Ordered-mode consumption: deliveries carry sequence state and
    /// are rejected when out of order.
    pub ordered: bool,
    /// Only dispatch messages carrying this tag; others are skipped.
    pub desired_tag: Option<String>,
    /// Per-connection ready-credit ceiling.
    pub rdy_per_connection: u32,
    /// Budget the handler has to process one message before the broker
    /// is expected to time it out and redeliver.
    pub message_timeout: Duration,
    /// Default requeue delay stamped on messages that do not carry one.
    /// `None` keeps finish-now semantics.
    pub default_requeue_delay: Option<Duration>,
    /// Attempts after which a failing message is republished as a
    /// compensation copy instead of requeued again.
    pub max_requeue_attempts: u16,
    /// When the SDK acknowledges on the application's behalf. `false`
    /// leaves FIN/REQ entirely to the application.
    pub auto_finish: bool,
    /// Dispatcher worker task count.
    pub worker_count: usize,
    /// Dispatcher queue capacity; a full queue requeues the message and
    /// backs the topic off.
    pub queue_capacity: usize,
    /// Requeue delay used when the worker pool rejects a submission.
    pub saturation_requeue_delay: Duration,
    /// Directory endpoint list refresh cadence.
    pub lookup_poll_interval: Duration,
    /// Retries inside one discovery resolve before the error surfaces.
    pub lookup_max_retries: u32,
    /// Topology reconciliation cadence.
    pub reconcile_interval: Duration,
    /// Credit redistribution cadence.
    pub redistribute_interval: Duration,
    /// Delay before the first redistribution pass.
    pub redistribute_warmup: Duration,
    /// How long to wait for one connection to acknowledge a credit
    /// update before proceeding best-effort.
    pub rdy_ack_timeout: Duration,
    /// Base interval between authoritative aggregate-credit recounts;
    /// scaled down by the per-topic correctness factor.
    pub proofread_interval: Duration,
    /// Load factor at or below which credit may grow.
    pub load_threshold: f32,
    /// Load factor at or above which credit is reclaimed when timeout
    /// risk is flagged.
    pub load_water_high: f32,
    /// Publish attempts before giving up.
    pub publish_max_attempts: u32,
    /// Base for exponential backoff between publish attempts.
    pub publish_retry_base: Duration,
    /// Pooled connections per broker address on the publisher path.
    pub pool_size_per_address: usize,
    /// Topics idle longer than this have their pooled resources
    /// released by the background sweep.
    pub topic_expiration: Duration,
    /// Idle-topic sweep cadence.
    pub sweep_interval: Duration,
    /// Round-trip budget for handshakes and heartbeat probes.
    pub query_timeout: Duration,
    /// Grace period for in-flight handler work during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get() * 4)
            .unwrap_or(8);
        Self {
            lookupd_http_addresses: Vec::new(),
            channel: String::new(),
            ordered: false,
            desired_tag: None,
            rdy_per_connection: 3,
            message_timeout: Duration::from_secs(60),
            default_requeue_delay: None,
            max_requeue_attempts: 10,
            auto_finish: true,
            worker_count: workers,
            queue_capacity: workers * 4,
            saturation_requeue_delay: Duration::from_secs(3),
            lookup_poll_interval: Duration::from_secs(60),
            lookup_max_retries: 3,
            reconcile_interval: Duration::from_secs(30),
            redistribute_interval: Duration::from_secs(5),
            redistribute_warmup: Duration::from_secs(20),
            rdy_ack_timeout: Duration::from_millis(100),
            proofread_interval: Duration::from_secs(30 * 60),
            load_threshold: 1.5,
            load_water_high: 1.75,
            publish_max_attempts: 6,
            publish_retry_base: Duration::from_millis(100),
            pool_size_per_address: 5,
            topic_expiration: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30 * 60),
            query_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Checks the invariants a consumer needs before starting.
    pub fn validate_for_consume(&self) -> Result<()> {
        if self.lookupd_http_addresses.is_empty() {
            return Err(Error::InvalidConfig(
                "no lookupd addresses configured".into(),
            ));
        }
        if self.channel.is_empty() {
            return Err(Error::InvalidConfig("channel name is blank".into()));
        }
        if self.rdy_per_connection == 0 {
            return Err(Error::InvalidConfig("rdy_per_connection must be > 0".into()));
        }
        if self.worker_count == 0 {
            return Err(Error::InvalidConfig("worker_count must be > 0".into()));
        }
        Ok(())
    }

    /// Checks the invariants a producer needs before starting.
    pub fn validate_for_publish(&self) -> Result<()> {
        if self.lookupd_http_addresses.is_empty() {
            return Err(Error::InvalidConfig(
                "no lookupd addresses configured".into(),
            ));
        }
        if self.publish_max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "publish_max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn lookupd_http_addresses(mut self, addresses: Vec<String>) -> Self {
        self.config.lookupd_http_addresses = addresses;
        self
    }

    pub fn lookupd_http_address(mut self, address: impl Into<String>) -> Self {
        self.config.lookupd_http_addresses.push(address.into());
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.config.channel = channel.into();
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.config.ordered = ordered;
        self
    }

    pub fn desired_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.desired_tag = Some(tag.into());
        self
    }

    pub fn rdy_per_connection(mut self, rdy: u32) -> Self {
        self.config.rdy_per_connection = rdy;
        self
    }

    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.config.message_timeout = timeout;
        self
    }

    pub fn default_requeue_delay(mut self, delay: Option<Duration>) -> Self {
        self.config.default_requeue_delay = delay;
        self
    }

    pub fn max_requeue_attempts(mut self, attempts: u16) -> Self {
        self.config.max_requeue_attempts = attempts;
        self
    }

    pub fn auto_finish(mut self, auto_finish: bool) -> Self {
        self.config.auto_finish = auto_finish;
        self
    }

    pub fn worker_count(mut self, workers: usize) -> Self {
        self.config.worker_count = workers;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn lookup_poll_interval(mut self, interval: Duration) -> Self {
        self.config.lookup_poll_interval = interval;
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.config.reconcile_interval = interval;
        self
    }

    pub fn redistribute_interval(mut self, interval: Duration) -> Self {
        self.config.redistribute_interval = interval;
        self
    }

    pub fn redistribute_warmup(mut self, warmup: Duration) -> Self {
        self.config.redistribute_warmup = warmup;
        self
    }

    pub fn rdy_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.rdy_ack_timeout = timeout;
        self
    }

    pub fn proofread_interval(mut self, interval: Duration) -> Self {
        self.config.proofread_interval = interval;
        self
    }

    pub fn publish_max_attempts(mut self, attempts: u32) -> Self {
        self.config.publish_max_attempts = attempts;
        self
    }

    pub fn publish_retry_base(mut self, base: Duration) -> Self {
        self.config.publish_retry_base = base;
        self
    }

    pub fn pool_size_per_address(mut self, size: usize) -> Self {
        self.config.pool_size_per_address = size;
        self
    }

    pub fn topic_expiration(mut self, expiration: Duration) -> Self {
        self.config.topic_expiration = expiration;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.config.query_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.rdy_per_connection, 3);
        assert_eq!(config.publish_max_attempts, 6);
        assert!(config.auto_finish);
        assert!(config.worker_count > 0);
        assert_eq!(config.queue_capacity, config.worker_count * 4);
    }

    #[test]
    fn builder_overrides() {
        let config = Config::builder()
            .lookupd_http_address("127.0.0.1:4161")
            .channel("billing")
            .rdy_per_connection(8)
            .ordered(true)
            .max_requeue_attempts(2)
            .build();
        assert_eq!(config.lookupd_http_addresses, vec!["127.0.0.1:4161"]);
        assert_eq!(config.channel, "billing");
        assert_eq!(config.rdy_per_connection, 8);
        assert!(config.ordered);
        assert_eq!(config.max_requeue_attempts, 2);
    }

    #[test]
    fn consume_validation() {
        assert!(Config::default().validate_for_consume().is_err());
        let ok = Config::builder()
            .lookupd_http_address("127.0.0.1:4161")
            .channel("ch")
            .build();
        assert!(ok.validate_for_consume().is_ok());

        let no_channel = Config::builder()
            .lookupd_http_address("127.0.0.1:4161")
            .build();
        assert!(no_channel.validate_for_consume().is_err());
    }
}
