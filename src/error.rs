//! Driver Error Types
//!
//! All fallible operations in the dispatch core report through [`DriverError`].
//! Per-operation failures travel through the operation's completion handle;
//! connection-wide failures (the handshake) are returned to the caller that
//! initiated the connection. Nothing in this crate panics across the dispatch
//! boundary.

use thiserror::Error;

/// Errors produced by the dispatch core.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The handshake required a master and the server reported it is not one.
    #[error("no master found")]
    NoMaster,

    /// The transport is closed and the operation requested immediate delivery.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The per-connection pending queue hit its configured bound.
    #[error("pending operation queue is full (limit: {limit})")]
    PendingQueueFull { limit: usize },

    /// A serialized message exceeds the connection's negotiated maximum.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: i32 },

    /// A write-class message was routed through the read path, or vice versa.
    #[error("{op} message routed through the wrong dispatch path")]
    ProtocolShape { op: &'static str },

    /// A modify-and-fetch operation matched no document.
    #[error("no matching document")]
    NotFound,

    /// The server acknowledged a write with an error.
    #[error("write failed: {message} (code {code})")]
    WriteFailure { code: i32, message: String },

    /// A command reply reported failure for a reason other than "not found".
    #[error("command failed: {message}")]
    CommandFailure { message: String },

    /// An inbound reply or document could not be decoded.
    #[error("malformed reply: {0}")]
    Malformed(String),

    /// A freshly allocated request id displaced an in-flight entry.
    ///
    /// Request ids are a monotonically increasing per-driver counter, so this
    /// only occurs after the counter wraps while the displaced operation is
    /// still outstanding. It is reported, never silently absorbed.
    #[error("request id {0} already in flight")]
    IdCollision(i32),

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::PendingQueueFull { limit: 8 };
        assert_eq!(err.to_string(), "pending operation queue is full (limit: 8)");

        let err = DriverError::MessageTooLarge {
            size: 5_000_000,
            max: 4_194_304,
        };
        assert_eq!(err.to_string(), "message too large: 5000000 bytes (max: 4194304)");

        let err = DriverError::WriteFailure {
            code: 11000,
            message: "duplicate key".to_string(),
        };
        assert_eq!(err.to_string(), "write failed: duplicate key (code 11000)");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: DriverError = io.into();
        assert!(matches!(err, DriverError::Io(_)));
    }
}
