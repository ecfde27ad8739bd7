//! Wire vocabulary for the relayq client SDK.
//!
//! This crate holds the types exchanged at the boundary between the SDK
//! core and the transport layer: broker addresses, topics, decoded
//! messages, the commands the core produces, and the [`Frame`] sum type
//! the core consumes. Frame encoding/decoding and socket handling live
//! behind the [`Transport`]/[`Connector`] traits and are supplied by the
//! embedding application (or by the in-memory implementation the SDK
//! ships for tests).

pub mod command;
pub mod frame;
pub mod transport;
pub mod types;

pub use command::Command;
pub use frame::{BrokerError, BrokerErrorCode, Frame};
pub use transport::{Connector, Transport};
pub use types::{Address, Message, MessageId, Sequence, Topic};
