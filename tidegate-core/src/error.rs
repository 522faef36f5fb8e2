//! Error types for the socket engine.
//!
//! Failures are classified the way the workers react to them:
//! retriable I/O conditions are not errors at all (the socket is simply
//! re-armed), everything else in this enum is fatal to the connection that
//! produced it and never unwinds past the socket boundary.

use std::io;
use thiserror::Error;

/// Errors produced by the socket engine.
#[derive(Debug, Error)]
pub enum NetError {
    /// The peer violated the wire protocol (bad frame length, bad
    /// compressed unit). The connection is closed, never retried.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A message exceeded the configured maximum at construction time.
    #[error("message of {size} bytes exceeds maximum of {max}")]
    TooLarge {
        /// Total framed size of the rejected message.
        size: usize,
        /// Configured maximum message size.
        max: usize,
    },

    /// The block pool had no free blocks for the connection being serviced.
    #[error("block pool exhausted")]
    PoolExhausted,

    /// The send-side byte ceiling was exceeded. The slow consumer is
    /// disconnected rather than buffered without bound.
    #[error("send buffer overrun: {buffered} bytes buffered, limit {limit}")]
    SendOverrun {
        /// Bytes currently buffered for the socket.
        buffered: usize,
        /// Configured send ceiling.
        limit: usize,
    },

    /// The manager's socket or listener table is full.
    #[error("{kind} capacity reached, limit {max}")]
    Capacity {
        /// Which table filled up (`"socket"` or `"listener"`).
        kind: &'static str,
        /// Configured table size.
        max: usize,
    },

    /// Registering or re-arming a socket with the readiness multiplexer
    /// failed. Fatal to the socket.
    #[error("multiplexer registration failed: {0}")]
    Registration(io::Error),

    /// The operation targeted a socket that is already closing or closed.
    #[error("socket is closed")]
    Closed,

    /// A non-retriable OS error from a socket call.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used throughout the engine.
pub type NetResult<T> = Result<T, NetError>;

/// Returns true for I/O conditions that are not failures: the operation
/// should be re-armed with the multiplexer and retried later.
pub fn is_retriable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        let would_block = io::Error::new(io::ErrorKind::WouldBlock, "try again");
        let interrupted = io::Error::new(io::ErrorKind::Interrupted, "signal");
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "gone");

        assert!(is_retriable(&would_block));
        assert!(is_retriable(&interrupted));
        assert!(!is_retriable(&reset));
    }

    #[test]
    fn test_error_display() {
        let err = NetError::TooLarge {
            size: 300_000,
            max: 262_144,
        };
        let text = format!("{}", err);
        assert!(text.contains("300000"));
        assert!(text.contains("262144"));
    }
}
