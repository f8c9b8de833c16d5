//! Error taxonomy for the Transport Services API.
//!
//! Synchronous API calls return `Err` for immediate failures (bad arguments,
//! no eligible protocol stack, library misuse). Asynchronous failures are
//! never returned from the originating call; they arrive on the registered
//! callbacks (`establishment_error`, `send_error`, `connection_error`, ...).

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TapsError>;

/// All error conditions surfaced by the Transport Services runtime.
#[derive(Debug, Error)]
pub enum TapsError {
    /// A required argument was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An operation was invoked before `initialize` on this thread.
    #[error("transport services runtime is not initialized on this thread")]
    NotInitialized,

    /// `initialize` was invoked twice on the same thread.
    #[error("transport services runtime is already initialized on this thread")]
    AlreadyInitialized,

    /// `close_library` was invoked while connections are still live.
    #[error("{0} connection(s) are still open")]
    LiveConnections(usize),

    /// No registered protocol stack satisfies the Require/Prohibit
    /// selection properties.
    #[error("no protocol stack satisfies the selection properties")]
    NoCandidate,

    /// Hostname resolution failed.
    #[error("name resolution failed for {0}")]
    Dns(String),

    /// Neither a numeric port nor a resolvable service name was available.
    #[error("no port could be resolved for service {0:?}")]
    NoPort(String),

    /// Interface enumeration failed while resolving a local endpoint.
    #[error("could not enumerate addresses for interface {0:?}")]
    NoInterface(String),

    /// Establishment did not complete before the user-supplied deadline.
    #[error("establishment timed out")]
    Timeout,

    /// Every candidate stack failed to establish.
    #[error("establishment failed: {0}")]
    Establishment(String),

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The operation targeted a connection that is closing or closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A message's lifetime elapsed before it could be dispatched.
    #[error("message lifetime expired before dispatch")]
    SendExpired,

    /// A per-message send failure; the connection may remain usable.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// An I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate or TLS configuration problem.
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl TapsError {
    /// Map an I/O error into the taxonomy, distinguishing a peer reset
    /// (which transitions the connection to CLOSED) from other failures.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                TapsError::ConnectionReset
            }
            _ => TapsError::Io(err),
        }
    }
}
