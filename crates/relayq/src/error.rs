use relayq_protocol::BrokerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("order violation on connection {connection_id}: {detail}")]
    OrderViolation { connection_id: u64, detail: String },

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("tag not supported by topic: {0}")]
    TagNotSupported(String),

    #[error("worker pool saturated")]
    WorkerSaturated,

    #[error("connection pool exhausted for {0}")]
    PoolExhausted(String),

    #[error("publish failed after {attempts} attempts: {last}")]
    PublishExhausted { attempts: u32, last: Box<Error> },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("client is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed directory response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that permanently fail a publish attempt: retrying against
    /// the same or another broker cannot succeed.
    pub fn is_fatal_publish(&self) -> bool {
        match self {
            Error::InvalidTopic(_) | Error::InvalidMessage(_) | Error::TagNotSupported(_) => true,
            Error::Broker(e) => e.code.is_fatal_publish(),
            Error::Closed => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayq_protocol::BrokerError;

    #[test]
    fn fatal_publish_classification() {
        assert!(Error::InvalidTopic("t".into()).is_fatal_publish());
        assert!(Error::TagNotSupported("t".into()).is_fatal_publish());
        assert!(Error::Broker(BrokerError::parse("E_BAD_MESSAGE oversize")).is_fatal_publish());
        assert!(!Error::Connection("reset".into()).is_fatal_publish());
        assert!(!Error::Broker(BrokerError::parse("E_FAILED_ON_NOT_LEADER")).is_fatal_publish());
    }
}
