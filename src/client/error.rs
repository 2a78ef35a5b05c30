// ABOUTME: Client-side error types for codec service operations
// ABOUTME: Distinguishes service rejection from timeout and transport loss

use crate::framing::FramingError;
use std::io;
use thiserror::Error;

/// Errors surfaced by [`crate::client::AvClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The service answered the command with a Nack.
    #[error("command rejected by the service")]
    Rejected,

    /// No response frame or bulk payload arrived within the reply
    /// timeout.
    #[error("timed out waiting for the service")]
    Timeout,

    /// The transport closed underneath the operation.
    #[error("transport closed")]
    Closed,

    /// Connecting to or spawning the service failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

impl From<FramingError> for ClientError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::Timeout => ClientError::Timeout,
            FramingError::Closed => ClientError::Closed,
        }
    }
}
