//! Error types for the bridge

use thiserror::Error;

/// Result alias used throughout the crate
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by the codec, the upstream connection and the bridge loops.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport could not be opened or the banner was not read
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Connect or handshake read did not complete in time
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Login reply was not `Response: Success`
    #[error("authentication failed: {reply}")]
    AuthenticationFailed { reply: String },

    /// Upstream closed the connection
    #[error("connection closed by upstream")]
    ConnectionClosed,

    /// A line without a colon was skipped by the parser
    #[error("malformed line skipped: {line:?}")]
    MalformedLine { line: String },

    /// Invalid outgoing command or corrupted inbound stream
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// No session is registered under this token
    #[error("no session registered with token {token:?}")]
    UnknownSession { token: String },

    /// Some buffered records could not be serialized
    #[error("{count} buffered record(s) could not be serialized")]
    SerializationAnomaly { count: usize },

    /// Writing a command frame to the upstream failed
    #[error("failed to write command upstream: {0}")]
    DispatchWrite(#[source] std::io::Error),

    /// The command queue is at capacity
    #[error("command queue is full")]
    QueueFull,

    /// No correlated record arrived within the reply timeout
    #[error("no reply for {token:?} within {timeout_ms}ms")]
    ReplyTimeout { token: String, timeout_ms: u64 },

    /// The dispatcher is no longer accepting commands
    #[error("command dispatcher stopped")]
    DispatcherStopped,

    /// Configuration could not be loaded
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl BridgeError {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the error ends the process when raised by a bridge loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BridgeError::MalformedLine { .. }
                | BridgeError::UnknownSession { .. }
                | BridgeError::SerializationAnomaly { .. }
                | BridgeError::QueueFull
                | BridgeError::ReplyTimeout { .. }
        )
    }
}
