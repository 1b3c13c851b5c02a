use std::time::Duration;

use fd_protocol::{DecodeError, TransportError};
use thiserror::Error;

/// Failures that end an agent session before it becomes active.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid server URL '{0}'")]
    InvalidServerUrl(String),

    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Connection closed during handshake")]
    HandshakeClosed,

    #[error("No handshake reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Invalid handshake reply: {0}")]
    HandshakeDecode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
