// ABOUTME: Error types for the pipewise-control crate.
// ABOUTME: Distinguishes unreachable workers, timeouts, and malformed replies.

use std::time::Duration;
use thiserror::Error;

/// Errors from one control exchange.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The control endpoint could not be reached.
    #[error("control endpoint unreachable at {address}: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// No reply arrived within the timeout.
    #[error("no control reply within {0:?}")]
    Timeout(Duration),

    /// The worker closed the connection without replying.
    #[error("control connection closed before a reply")]
    Closed,

    /// The reply was not a valid control message.
    #[error("malformed control reply: {0}")]
    Malformed(String),

    /// The address kind is not supported on this platform.
    #[error("unsupported control address: {0}")]
    Unsupported(String),

    /// Reading or writing the control connection failed.
    #[error("control I/O error: {0}")]
    Io(#[from] std::io::Error),
}
