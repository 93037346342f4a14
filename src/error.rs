//! Error types for aggwire-client.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all protocol and context operations.
#[derive(Debug, Error)]
pub enum AggError {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (JSON-array commands and the default table codec).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame or command.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame declared (or a builder tried to produce) more bytes than allowed.
    #[error("Command size {size} exceeds maximum {max}")]
    CommandTooLarge { size: usize, max: usize },

    /// Frame body carried no command content.
    #[error("Zero length command received")]
    ZeroLengthCommand,

    /// zlib body could not be inflated.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// The peer is gone or the session was torn down.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No reply arrived in time.
    #[error("Timeout waiting for reply after {0:?}")]
    Timeout(Duration),

    /// The remote side answered with a non-OK reply code.
    #[error("Remote error ({code}): {message}")]
    RemoteDevice {
        code: String,
        message: String,
        details: Option<String>,
    },

    /// Accessor used on the wrong kind of command, index out of range, etc.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Context-level failure (missing definition, failed initialization).
    #[error("Context error: {0}")]
    Context(String),

    /// A coalesced read was invalidated more times than it may be retried.
    #[error("Read of variable '{variable}' was cancelled by invalidation")]
    ReadCancelled { variable: String },

    /// Another caller's read of the same variable failed.
    #[error("Error getting variable '{variable}' from pending request: {message}")]
    PendingRead { variable: String, message: String },

    /// Dispatcher queue no longer accepts work.
    #[error("Queue '{0}' is closed")]
    QueueClosed(String),

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl AggError {
    /// True for errors that are expected while a session reconnects.
    pub fn is_disconnection(&self) -> bool {
        matches!(
            self,
            AggError::Disconnected(_) | AggError::ConnectionClosed | AggError::Timeout(_)
        ) || matches!(self, AggError::Io(e) if is_disconnect_kind(e.kind()))
    }

    /// True for errors that reject a frame or command on the wire.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            AggError::Protocol(_)
                | AggError::CommandTooLarge { .. }
                | AggError::ZeroLengthCommand
                | AggError::Decompression(_)
        )
    }
}

fn is_disconnect_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof
    )
}

/// Result type alias using AggError.
pub type Result<T> = std::result::Result<T, AggError>;
