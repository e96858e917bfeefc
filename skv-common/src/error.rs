//! # Error Taxonomy
//!
//! Every failure in the driver surfaces as one `SkvError`. Acquisition errors
//! (`NotStarted`, `Busy`, `Timeout`, `Closed`) come from the pool, the rest
//! from a single connection.
//!
//! The enum is `Clone` so a placeholder client can hand the same error back
//! on every call; IO sources are kept behind an `Arc` for that reason.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result alias used across the workspace.
pub type SkvResult<T> = Result<T, SkvError>;

/// Errors surfaced by the pool and the protocol engine.
#[derive(Debug, Clone, Error)]
pub enum SkvError {
    /// An operation was attempted before `start` or after `close`.
    #[error("connectors not started")]
    NotStarted,

    /// The wait queue is saturated; the acquisition was rejected without blocking.
    #[error("pool is busy, wait for connection creation has reached {waiting}")]
    Busy { waiting: usize },

    /// No connection became available within the acquisition window.
    #[error("pool is busy, can not get new client in {timeout:?}, wait count is {waiting}")]
    Timeout { timeout: Duration, waiting: usize },

    /// The pool was torn down while the caller was waiting.
    #[error("pool is closed, can not get new client")]
    Closed,

    /// Dial, socket IO, or a command issued on a closed connection.
    #[error("connection error ({context}): {source}")]
    Connection {
        context: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    /// The server rejected the configured credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed frame on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An argument could not be framed (no encoder, or the encoder failed).
    #[error("bad argument type: {0}")]
    ArgumentType(String),

    /// Configuration rejected by `Config::validate`.
    #[error("invalid config: {0}")]
    Config(String),
}

impl SkvError {
    /// Wraps an IO error with the operation that produced it.
    pub fn connection(context: &'static str, source: io::Error) -> Self {
        SkvError::Connection {
            context,
            source: Arc::new(source),
        }
    }

    /// Error returned when a command is issued on a connection that is not open.
    pub fn closed() -> Self {
        Self::connection(
            "closed",
            io::Error::new(io::ErrorKind::NotConnected, "client is closed"),
        )
    }

    /// True for failures a fresh socket might fix.
    ///
    /// Auth and argument errors are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SkvError::Connection { .. } | SkvError::Protocol(_))
    }

    /// True for connection-level failures (dial, IO, closed socket).
    pub fn is_connection(&self) -> bool {
        matches!(self, SkvError::Connection { .. })
    }
}
