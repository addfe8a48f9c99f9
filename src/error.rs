//! Error types for framing and streaming

use std::io;
use thiserror::Error;

/// Failures while moving a framed message across the connection
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the connection cleanly before any byte of the next frame
    #[error("connection closed by peer")]
    Closed,

    /// Peer closed the connection in the middle of a frame
    #[error("truncated frame: {0}")]
    Truncated(&'static str),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Serialized payload does not fit the 2-byte length prefix
    #[error("payload too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    /// Payload is not structured data at all
    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Payload is structured data but a field has an unacceptable value
    #[error("invalid message: {0}")]
    Invalid(String),
}

impl ProtocolError {
    /// Whether the connection is still in a state where a reply frame can be sent
    pub fn is_reply_possible(&self) -> bool {
        matches!(self, ProtocolError::Malformed(_) | ProtocolError::Invalid(_))
    }
}

/// Failures inside the streaming bridge
#[derive(Debug, Error)]
pub enum TransferError {
    /// Reading the decoder's output failed
    #[error("decoder output failed: {0}")]
    Source(#[source] io::Error),

    /// The network peer failed while we were writing to it
    #[error("peer write failed: {0}")]
    Peer(#[source] io::Error),

    #[error("transfer cancelled by shutdown")]
    Cancelled,
}
