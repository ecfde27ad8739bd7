//! Broker addresses, topics and delivered messages.

use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Network location of one broker node, optionally pinned to a topic
/// partition.
///
/// Identity is `host + port + partition`; the reported broker `version`
/// is carried for diagnostics but never participates in equality,
/// hashing or ordering, so an upgraded broker does not look like a new
/// one to the topology diff.
#[derive(Debug, Clone)]
pub struct Address {
    pub host: String,
    pub port: u16,
    /// Partition served at this address, `None` for unpartitioned
    /// (legacy) broker entries.
    pub partition: Option<i64>,
    /// Broker software version as reported by the directory service.
    pub version: String,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            partition: None,
            version: String::new(),
        }
    }

    pub fn with_partition(mut self, partition: i64) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn has_partition(&self) -> bool {
        self.partition.is_some()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.partition == other.partition
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.partition.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host
            .cmp(&other.host)
            .then_with(|| self.port.cmp(&other.port))
            .then_with(|| self.partition.cmp(&other.partition))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            Some(p) => write!(f, "{}:{}#{}", self.host, self.port, p),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// A topic, optionally narrowed to a single partition.
///
/// A topic without a partition id denotes "all partitions".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    pub name: String,
    pub partition: Option<i64>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: None,
        }
    }

    pub fn with_partition(name: impl Into<String>, partition: i64) -> Self {
        Self {
            name: name.into(),
            partition: Some(partition),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            Some(p) => write!(f, "{}#{}", self.name, p),
            None => f.write_str(&self.name),
        }
    }
}

/// 16-byte broker-assigned message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Internal id / disk-queue offset pair attached to messages on ordered
/// topics. Both components grow strictly monotonically per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequence {
    pub internal_id: u64,
    pub offset: u64,
}

/// A delivered message as handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    /// Delivery attempts so far, including this one.
    pub attempts: u16,
    /// Broker publish timestamp, nanoseconds since the epoch.
    pub timestamp: u64,
    pub body: Bytes,
    /// Broker the message was delivered from. Filled in by the consumer
    /// before dispatch.
    pub address: Address,
    /// Id of the connection the message arrived on.
    pub connection_id: u64,
    /// Delay to apply if the message is requeued after a handler
    /// failure. `None` means finish-now semantics: no explicit requeue
    /// is ever issued for this message.
    pub next_consume_delay: Option<Duration>,
    /// Ordering state, present only on ordered topics.
    pub sequence: Option<Sequence>,
    /// Producer-attached routing tag, if any.
    pub tag: Option<String>,
}

impl Message {
    /// Minimal constructor for transport decoders; source fields are
    /// stamped by the consumer when the frame is routed.
    pub fn new(id: MessageId, attempts: u16, timestamp: u64, body: Bytes) -> Self {
        Self {
            id,
            attempts,
            timestamp,
            body,
            address: Address::new("", 0),
            connection_id: 0,
            next_consume_delay: None,
            sequence: None,
            tag: None,
        }
    }
}
