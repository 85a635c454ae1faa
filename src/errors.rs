use std::time::Duration;
use thiserror::Error;

/// Failures of the physical connection or of sending over it. These are
/// surfaced to the caller of the failing operation and never tear down the
/// process.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection attempt timed out")]
    ConnectTimeout,
    #[error("connection refused: {0}")]
    ConnectRefused(String),
    #[error("send on closed channel")]
    ChannelClosed,
    #[error("session has been shut down")]
    SessionClosed,
}

/// Failures of the persisted conversation records. Scans recover from these
/// by skipping the bad record; single-record operations propagate them.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record at {path}: {detail}")]
    Corrupt { path: String, detail: String },
    #[error("encode failure: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A correlated request saw no matching reply before its deadline.
    /// Distinct from transport failure so callers can retry sensibly.
    #[error("no matching reply within {waited:?}")]
    CorrelationTimeout { waited: Duration },
    /// The relay answered the request with an error frame.
    #[error("relay rejected request: {reason}")]
    Remote { reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
