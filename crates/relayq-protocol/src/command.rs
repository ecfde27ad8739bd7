//! Commands the SDK core issues to a broker connection.

use crate::types::{MessageId, Topic};
use bytes::Bytes;
use std::time::Duration;

/// One protocol command. Encoding to the wire is owned by the
/// [`Transport`](crate::Transport) implementation; the core only ever
/// constructs and matches these variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Subscribe a connection to a topic on a named channel.
    Subscribe { topic: Topic, channel: String },
    /// Subscribe in ordered mode: deliveries carry a [`Sequence`] and
    /// must be consumed strictly in order.
    ///
    /// [`Sequence`]: crate::types::Sequence
    SubscribeOrdered { topic: Topic, channel: String },
    /// Grant the broker permission to keep `0` up to `count` messages
    /// in flight on this connection.
    Ready { count: u32 },
    /// Acknowledge successful processing.
    Finish { id: MessageId },
    /// Return a message for redelivery after `delay`.
    Requeue { id: MessageId, delay: Duration },
    /// Publish a message body to a topic.
    Publish { topic: Topic, body: Bytes },
    /// Heartbeat probe / response.
    Nop,
    /// Begin a clean connection close handshake.
    Close,
}

impl Command {
    /// Short command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Subscribe { .. } => "SUB",
            Command::SubscribeOrdered { .. } => "SUB_ORDERED",
            Command::Ready { .. } => "RDY",
            Command::Finish { .. } => "FIN",
            Command::Requeue { .. } => "REQ",
            Command::Publish { .. } => "PUB",
            Command::Nop => "NOP",
            Command::Close => "CLS",
        }
    }
}
