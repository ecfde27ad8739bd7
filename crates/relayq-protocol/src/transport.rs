//! Seam to the transport layer.
//!
//! The SDK core never touches sockets or frame encoding. It drives a
//! [`Transport`] — one subscribed or pooled link to one broker — and
//! obtains new ones through a [`Connector`]. Implementations own
//! framing, heartbeating at the byte level, and TLS; the core owns
//! everything above (topology, credit, dispatch).

use crate::command::Command;
use crate::frame::Frame;
use crate::types::Address;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One live link to a broker.
///
/// `send` resolves once the command is accepted by the transport (the
/// write-side acknowledgement the flow-control engine uses to commit
/// credit deltas). `request` performs a command round-trip for the few
/// commands with a direct response (subscribe handshake, publish,
/// close).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, command: Command) -> io::Result<()>;

    async fn request(&self, command: Command) -> io::Result<Frame>;

    /// Whether the underlying link is still usable. Used by the broken
    /// sweep; must be cheap.
    fn is_connected(&self) -> bool;

    /// Tear down the link. Idempotent; never fails.
    async fn close(&self);
}

/// Factory dialing broker addresses.
///
/// On success the caller receives the transport plus the stream of
/// decoded frames arriving on it. Dropping the receiver does not close
/// the link; [`Transport::close`] does.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &Address,
    ) -> io::Result<(Arc<dyn Transport>, mpsc::Receiver<Frame>)>;
}
