//! Typed error hierarchy for the uTP engine
//!
//! A connection stores the first fatal cause it saw and hands a clone of it
//! to every later caller, so the error type is `Clone`; I/O errors are kept
//! behind an `Arc` for that reason.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::packet::HeaderError;

/// Main error type for sockets and connections
#[derive(Debug, Clone, Error)]
pub enum UtpError {
    /// Malformed header (dropped by the socket, surfaced only by the codec)
    #[error("Malformed packet: {0}")]
    Malformed(#[from] HeaderError),

    /// Operation on a connection that was closed locally
    #[error("Connection closed")]
    Closed,

    /// Peer sent ST_RESET
    #[error("Connection reset by peer")]
    PeerReset,

    /// A packet went unacknowledged past the write timeout
    #[error("Timed out waiting for ack")]
    AckTimeout,

    /// Nothing was received for the idle period
    #[error("No packet received for {0:?}")]
    IdleTimeout(Duration),

    /// A user deadline passed; the connection stays usable
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// SYN was never acknowledged
    #[error("Connect timed out")]
    ConnectTimeout,

    /// Dial was cancelled by the caller
    #[error("Dial cancelled")]
    Cancelled,

    /// Connection was destroyed; wraps the first fatal cause
    #[error("Connection destroyed: {0}")]
    Destroyed(Box<UtpError>),

    /// Socket is closed to new work
    #[error("Socket closed")]
    SocketClosed,

    /// Socket was torn down underneath its connections
    #[error("Socket destroyed: {0}")]
    SocketDestroyed(String),

    /// Every connection id towards this peer is taken
    #[error("No free connection id for {0}")]
    ConnIdsExhausted(SocketAddr),

    /// Invalid configuration value
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Underlying datagram I/O failed
    #[error("Network error: {0}")]
    Io(Arc<io::Error>),
}

impl UtpError {
    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Closest `io::ErrorKind`
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::Malformed(_) | Self::InvalidInput { .. } => io::ErrorKind::InvalidData,
            Self::Closed | Self::SocketClosed => io::ErrorKind::NotConnected,
            Self::PeerReset => io::ErrorKind::ConnectionReset,
            Self::AckTimeout
            | Self::IdleTimeout(_)
            | Self::DeadlineExceeded
            | Self::ConnectTimeout => io::ErrorKind::TimedOut,
            Self::Cancelled => io::ErrorKind::Interrupted,
            Self::Destroyed(cause) => cause.kind(),
            Self::SocketDestroyed(_) => io::ErrorKind::ConnectionAborted,
            Self::ConnIdsExhausted(_) => io::ErrorKind::AddrInUse,
            Self::Io(err) => err.kind(),
        }
    }

    /// Check if retrying the same operation can succeed
    pub fn is_timeout(&self) -> bool {
        self.kind() == io::ErrorKind::TimedOut
    }
}

/// Result type alias for uTP operations
pub type Result<T> = std::result::Result<T, UtpError>;

impl From<io::Error> for UtpError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<UtpError> for io::Error {
    fn from(err: UtpError) -> Self {
        io::Error::new(err.kind(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(UtpError::PeerReset.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(UtpError::DeadlineExceeded.kind(), io::ErrorKind::TimedOut);
        assert_eq!(
            UtpError::Destroyed(Box::new(UtpError::AckTimeout)).kind(),
            io::ErrorKind::TimedOut
        );
        assert!(UtpError::IdleTimeout(Duration::from_secs(1)).is_timeout());
        assert!(!UtpError::Closed.is_timeout());
    }

    #[test]
    fn test_into_io_error() {
        let err: io::Error = UtpError::PeerReset.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.to_string().contains("reset"));

        let err: UtpError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let cloned = err.clone();
        assert!(matches!(cloned, UtpError::Io(_)));
    }
}
