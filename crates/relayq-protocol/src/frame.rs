//! Decoded frames arriving from a broker connection.

use crate::types::Message;
use bytes::Bytes;
use std::fmt;

/// A frame decoded once at the transport boundary and matched
/// exhaustively by the core.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Plain response payload (`OK`, heartbeat probe, close ack).
    Response(Bytes),
    /// Broker-reported error.
    Error(BrokerError),
    /// A delivered message.
    Message(Message),
}

impl Frame {
    /// Whether this response frame is the broker heartbeat probe.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(b) if b.as_ref() == b"_heartbeat_")
    }
}

/// Error frame payload: the parsed code plus the raw broker text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct BrokerError {
    pub code: BrokerErrorCode,
    pub message: String,
}

impl BrokerError {
    /// Parse a raw error frame body, e.g.
    /// `E_FAILED_ON_NOT_LEADER cluster is electing`.
    pub fn parse(raw: &str) -> Self {
        let token = raw.split_whitespace().next().unwrap_or("");
        Self {
            code: BrokerErrorCode::from_token(token),
            message: raw.to_string(),
        }
    }
}

/// Broker error codes the core reacts to. Anything unrecognized maps to
/// [`BrokerErrorCode::Unknown`] and is logged, not acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorCode {
    /// The node answering is not the partition leader; the cached
    /// lookup result is stale.
    NotLeader,
    /// The node is read-only right now.
    NotWritable,
    /// Topic is unknown to this node.
    TopicNotExist,
    /// Malformed topic in a publish; not retryable.
    BadTopic,
    /// Malformed message in a publish; not retryable.
    BadMessage,
    /// Tagged publish to a topic without tag support; not retryable.
    TagNotSupported,
    /// Consuming this topic requires ordered-mode subscription.
    SubOrderRequired,
    /// Broker-side publish failure.
    PubFailed,
    Unknown,
}

impl BrokerErrorCode {
    pub fn from_token(token: &str) -> Self {
        match token {
            "E_FAILED_ON_NOT_LEADER" => Self::NotLeader,
            "E_FAILED_ON_NOT_WRITABLE" => Self::NotWritable,
            "E_TOPIC_NOT_EXIST" => Self::TopicNotExist,
            "E_BAD_TOPIC" => Self::BadTopic,
            "E_BAD_MESSAGE" => Self::BadMessage,
            "E_TAG_NOT_SUPPORT" => Self::TagNotSupported,
            "E_SUB_ORDER_IS_MUST" => Self::SubOrderRequired,
            "E_PUB_FAILED" => Self::PubFailed,
            _ => Self::Unknown,
        }
    }

    /// Codes that mean the cached topology is stale: the discovery
    /// cache must be invalidated and the connection dropped.
    pub fn invalidates_topology(&self) -> bool {
        matches!(self, Self::NotLeader | Self::NotWritable | Self::TopicNotExist)
    }

    /// Codes that make a publish attempt permanently fail.
    pub fn is_fatal_publish(&self) -> bool {
        matches!(self, Self::BadTopic | Self::BadMessage | Self::TagNotSupported)
    }
}

impl fmt::Display for BrokerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_error_tokens() {
        let err = BrokerError::parse("E_FAILED_ON_NOT_LEADER node 3 lost election");
        assert_eq!(err.code, BrokerErrorCode::NotLeader);
        assert!(err.code.invalidates_topology());
        assert!(!err.code.is_fatal_publish());

        let err = BrokerError::parse("E_BAD_MESSAGE body too large");
        assert_eq!(err.code, BrokerErrorCode::BadMessage);
        assert!(err.code.is_fatal_publish());
    }

    #[test]
    fn unknown_token_is_unknown() {
        let err = BrokerError::parse("E_SOMETHING_NEW");
        assert_eq!(err.code, BrokerErrorCode::Unknown);
        assert!(!err.code.invalidates_topology());
    }

    #[test]
    fn heartbeat_detection() {
        assert!(Frame::Response(Bytes::from_static(b"_heartbeat_")).is_heartbeat());
        assert!(!Frame::Response(Bytes::from_static(b"OK")).is_heartbeat());
    }
}
