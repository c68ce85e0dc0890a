//! Driver Error Taxonomy
//!
//! Every fallible operation in the driver returns [`DriverError`].
//!
//! ## Propagation
//!
//! - `ConnectionClosed` is retried once by the [`PoolMaster`](crate::pool::PoolMaster);
//!   everything else reaches the caller unchanged.
//! - `Protocol` anomalies that cannot be tied to a request are only logged by the
//!   connection and never surface here.
//! - `Validation`, `PoolExhausted` and `PoolDraining` are raised before any network I/O.
//!
//! The enum is `Clone` because a copy of it is used as the terminal value that
//! unblocks every waiter of a dying connection.

use crate::protocol::{ParseError, ResponseType};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Errors produced by the driver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// The request was issued against a connection that is not open, or the
    /// connection died while the request was outstanding.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Every connection of the pool was busy for longer than the acquire bound.
    #[error("pool exhausted: all {max} connections busy")]
    PoolExhausted { max: usize },

    /// The pool (or pool master) is draining and rejects new work.
    #[error("pool is draining")]
    PoolDraining,

    /// The pool gave up reconnecting and has no live connection to offer.
    #[error("pool unavailable: {0}")]
    Unavailable(String),

    /// Malformed or unexpected data on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller-supplied options or configuration were rejected before any I/O.
    #[error("{0}")]
    Validation(String),

    /// The server refused the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// No response arrived within the configured bound.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered the query with an error response.
    #[error("{kind}: {message}")]
    Query { kind: ResponseType, message: String },
}

impl DriverError {
    /// Returns true for failures caused by the transport going away.
    ///
    /// These are the only failures the pool master retries.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DriverError::ConnectionClosed)
    }
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        DriverError::Io(Arc::new(err))
    }
}

impl From<ParseError> for DriverError {
    fn from(err: ParseError) -> Self {
        DriverError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::Protocol(err.to_string())
    }
}

/// Result type used throughout the driver.
pub type Result<T> = std::result::Result<T, DriverError>;
