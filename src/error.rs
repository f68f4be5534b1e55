use crate::ErrorKind;
use thiserror::Error;

/// Errors that can occur while running or calling the RPC service.
///
/// Per-call failures on the server side never surface here; they are turned
/// into error replies (see [`CallError`](crate::CallError)).
#[derive(Error, Debug)]
pub enum Error {
    /// Request timed out waiting for a reply
    #[error("request timed out")]
    Timeout,

    /// Broker connection or subscription dropped underneath the consumer loop
    #[error("broker connection lost")]
    ConnectionLost,

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport-level failure (connect, declare, publish, consume)
    #[error("transport error: {0}")]
    Transport(String),

    /// Required setting missing or malformed at startup
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Method name rejected at registration time
    #[error("invalid method name: {0:?}")]
    InvalidMethodName(String),

    /// Server answered the call with an error reply
    #[error("remote call failed ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },

    /// Failure while starting or stopping a server task
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Socket or file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigInvalid(err.to_string())
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, Error>;
