//! Error types for pipebench.

use thiserror::Error;

/// Error type for benchmark client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No bootstrap endpoint was configured for this shard.
    #[error("no remote endpoint configured for shard {0}")]
    NoRemoteEndpoint(usize),
    /// The remote end did not start a session.
    #[error("remote end did not start a session")]
    NoRemoteSession,
    /// A required response payload was empty.
    #[error("response payload was empty")]
    EmptyResponse,
    /// No response arrived within the attempt's timeout.
    #[error("request timed out")]
    RequestTimeout,
    /// The transport is tearing down.
    #[error("transport is shutting down")]
    TransportShutdown,
    /// A retry driver was run more than once.
    #[error("retry driver has already been used")]
    DuplicateInvocation,
    /// The shard was stopped while an operation was in flight.
    #[error("operation cancelled by shard stop")]
    Cancelled,
    /// An endpoint URL could not be parsed.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
    /// A frame failed header validation.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// A fixed-layout record was too short or otherwise unreadable.
    #[error("malformed {0} record")]
    MalformedRecord(&'static str),
    /// Metric registration failed.
    #[error("metrics: {0}")]
    Metrics(String),
    /// IO error from the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for benchmark client operations.
pub type Result<T> = std::result::Result<T, Error>;
