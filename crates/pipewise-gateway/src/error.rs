// ABOUTME: Error types for the gateway transport.
// ABOUTME: Codec failures are per-message; I/O and closed-peer errors end a connection.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("invalid message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when the connection can not carry further messages.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Codec(_))
    }
}
