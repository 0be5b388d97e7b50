//! Error types for sessionwire.
//!
//! Stream-level failures are classified exactly once, by
//! [`FaultStream`](crate::transport::FaultStream), into a [`StreamFault`].
//! Everything upstream reacts to that classification and never looks at the
//! raw `std::io::Error` again.

use std::fmt;
use std::io;

use thiserror::Error;

/// Classified outcome of a failed stream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFault {
    /// The owner closed the stream (or abandoned it) on this side.
    ClosedLocally,
    /// The peer closed the connection (zero-byte read).
    ClosedRemotely,
    /// Any other I/O failure, or an operation after the stream was switched
    /// to its error state.
    TransportLost,
}

impl StreamFault {
    /// Wrap this fault in an `io::Error` so it can travel through the
    /// `AsyncRead`/`AsyncWrite` plumbing.
    pub fn into_io(self) -> io::Error {
        let kind = match self {
            StreamFault::ClosedLocally => io::ErrorKind::NotConnected,
            StreamFault::ClosedRemotely => io::ErrorKind::UnexpectedEof,
            StreamFault::TransportLost => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, self)
    }

    /// Recover the classification from an `io::Error`.
    ///
    /// Errors that did not come out of a fault stream are transport losses.
    pub fn classify(err: &io::Error) -> StreamFault {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<StreamFault>())
            .copied()
            .unwrap_or(StreamFault::TransportLost)
    }
}

impl fmt::Display for StreamFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamFault::ClosedLocally => write!(f, "connection closed locally"),
            StreamFault::ClosedRemotely => write!(f, "connection closed remotely"),
            StreamFault::TransportLost => write!(f, "connection lost"),
        }
    }
}

impl std::error::Error for StreamFault {}

/// Main error type for all sessionwire operations.
#[derive(Debug, Error)]
pub enum SessionwireError {
    /// I/O error that has not been classified (configuration files, socket setup).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Peer speaks a different handshake version. Fatal, never retried.
    #[error("handshake version mismatch (local version {local})")]
    VersionMismatch {
        /// Version this side offered or expected.
        local: i16,
    },

    /// The handshake was abandoned on this side while in progress.
    #[error("handshake canceled")]
    HandshakeCanceled,

    /// The transport failed.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection was closed by this side.
    #[error("connection closed locally")]
    ConnectionClosedLocally,

    /// The connection was closed by the peer.
    #[error("connection closed remotely")]
    ConnectionClosedRemotely,

    /// A decoded envelope names a type hash that nobody registered.
    #[error("unregistered message type with hash {0}")]
    UnregisteredType(i32),

    /// Unexpected failure wrapped with its original cause.
    #[error("unknown protocol error: {0}")]
    UnknownProtocol(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Malformed frame or envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A pending message waited longer than the acknowledgment timeout.
    #[error("acknowledgment timeout")]
    AckTimeout,

    /// Payload does not fit the 16-bit signed length field.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Largest encodable payload.
        max: usize,
    },

    /// Every message id is currently held by a pending message.
    #[error("no free message id: pending window is full")]
    PendingWindowFull,

    /// The request was outstanding when the connection went away.
    #[error("request aborted: connection left the connected state")]
    RequestAborted,

    /// The response decoded to a different type than the caller asked for.
    #[error("unexpected response type: expected {expected}, got {actual}")]
    UnexpectedResponseType {
        /// Type the caller asked for.
        expected: &'static str,
        /// Type the envelope carried.
        actual: &'static str,
    },

    /// Backpressure timeout - writer queue full.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// The session was shut down.
    #[error("session closed")]
    SessionClosed,
}

impl SessionwireError {
    /// True for errors that must never be retried by the connect loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionwireError::VersionMismatch { .. })
    }

    /// Wrap an arbitrary cause as an opaque protocol error.
    pub fn unknown<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SessionwireError::UnknownProtocol(Box::new(err))
    }
}

impl From<StreamFault> for SessionwireError {
    fn from(fault: StreamFault) -> Self {
        match fault {
            StreamFault::ClosedLocally => SessionwireError::ConnectionClosedLocally,
            StreamFault::ClosedRemotely => SessionwireError::ConnectionClosedRemotely,
            StreamFault::TransportLost => SessionwireError::ConnectionLost,
        }
    }
}

/// Result type alias using SessionwireError.
pub type Result<T> = std::result::Result<T, SessionwireError>;
