//! Error types shared by the codec, client and server.
//!
//! Every failure a caller can observe maps onto one variant of [`Error`].
//! Per-connection errors on the server side are logged and contained to
//! that connection; on the client side they are returned as-is.

use std::io;
use std::time::Duration;

/// Alias for `Result<T, fjson::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by fjson operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client could not reach the host within its timeout.
    #[error("dial {host}: {source}")]
    Dial {
        /// Address that was dialed.
        host: String,
        /// Underlying network failure.
        #[source]
        source: io::Error,
    },

    /// The outbound value could not be serialized as JSON.
    #[error("marshal error: {0}")]
    Marshal(#[source] serde_json::Error),

    /// A received frame was not valid JSON.
    #[error("unmarshal error: {0}")]
    Unmarshal(#[source] serde_json::Error),

    /// Writing a frame to the socket failed.
    #[error("write error: {0}")]
    Write(#[source] io::Error),

    /// Reading from the socket failed.
    #[error("read error: {0}")]
    Read(#[source] io::Error),

    /// The stream ended before a frame terminator was seen.
    #[error("stream ended mid-frame ({buffered} bytes without terminator)")]
    TruncatedFrame {
        /// Number of unterminated bytes that were buffered at EOF.
        buffered: usize,
    },

    /// The peer closed the connection before sending a frame, or the
    /// connection was already closed locally.
    #[error("connection closed")]
    Closed,

    /// The exchange deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The server could not acquire its listen address.
    #[error("bind {addr}: {source}")]
    Bind {
        /// Address the server tried to listen on.
        addr: String,
        /// Underlying socket failure.
        #[source]
        source: io::Error,
    },

    /// A socket query on an already bound listener failed.
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),

    /// The server was asked to serve before its listener was bound.
    #[error("server is not listening")]
    NotListening,

    /// The handler signalled a condition the protocol layer cannot recover from.
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
}

impl Error {
    /// Returns true if this error is an elapsed exchange deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Returns true if the connection that produced this error must not be reused.
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(
            self,
            Error::Marshal(_) | Error::Unmarshal(_) | Error::Handler(_)
        )
    }
}

/// Error returned by a [`Handler`](crate::Handler).
///
/// Business-level failures (bad input, missing fields) should be encoded in
/// the response value instead, so the peer receives a structured answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::Dial {
            host: "127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().starts_with("dial 127.0.0.1:1: "));

        let err = Error::TruncatedFrame { buffered: 7 };
        assert_eq!(
            err.to_string(),
            "stream ended mid-frame (7 bytes without terminator)"
        );

        let err = Error::Socket(io::Error::from(io::ErrorKind::NotConnected));
        assert!(err.to_string().starts_with("socket error: "));

        let err = Error::from(HandlerError::new("boom"));
        assert_eq!(err.to_string(), "handler error: boom");
    }

    #[test]
    fn test_classification() {
        assert!(Error::Timeout(Duration::from_millis(10)).is_timeout());
        assert!(!Error::Closed.is_timeout());

        assert!(Error::Closed.is_fatal_to_connection());
        assert!(Error::TruncatedFrame { buffered: 1 }.is_fatal_to_connection());
        assert!(!Error::Handler(HandlerError::new("x")).is_fatal_to_connection());
    }
}
