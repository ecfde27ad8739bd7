//! Client SDK for the relayq distributed pub/sub message queue.
//!
//! The SDK discovers broker nodes through a lookupd-style directory
//! service, maintains a pool of live connections per broker, subscribes
//! topics/partitions, and runs cooperative ready-credit flow control so
//! each connection only ever receives as many in-flight messages as the
//! consumer can safely process. The application supplies a message
//! handler and a configuration; topology discovery, connection
//! lifecycle, backpressure, retry and compensation are owned here.
//!
//! # Architecture
//!
//! - [`lookup`] — directory client: topic+partition → broker addresses,
//!   round-robin endpoint selection, periodic refresh.
//! - [`reconcile`] — diffs the desired broker set against held
//!   connections each cycle; removals strictly before additions.
//! - [`flow`] — per-topic ready-credit accounting, backoff/resume and
//!   periodic redistribution with drift-correcting proofreads.
//! - [`dispatch`] — bounded worker pool running the handler and
//!   choosing the acknowledgement command.
//! - [`consumer`] / [`producer`] — the public facades.
//!
//! Wire framing and socket handling are not part of this crate: the
//! embedding application provides them through the
//! [`Transport`]/[`Connector`] traits from `relayq-protocol`.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod lookup;
pub mod pool;
pub mod producer;
pub mod reconcile;

#[doc(hidden)]
pub mod testing;

pub use config::{Config, ConfigBuilder};
pub use connection::Connection;
pub use consumer::{Consumer, ConsumerStats};
pub use dispatch::{CompensationPublisher, Handler, HandlerError};
pub use error::{Error, Result};
pub use flow::{ConsumeInfo, FlowControlEngine};
pub use lookup::{Discovery, LookupClient, PartitionMap, ShardingKey};
pub use pool::ConnectionPool;
pub use producer::{Producer, ProducerStats};
pub use reconcile::TopologyReconciler;

pub use relayq_protocol::{
    Address, BrokerError, BrokerErrorCode, Command, Connector, Frame, Message, MessageId,
    Sequence, Topic, Transport,
};
