use thiserror::Error;

use crate::codec::MessageKind;

/// Failure on the underlying connection. Any of these means the connection is
/// no longer usable; the read loop decides what to do about it.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("transport error: {0}")]
    Io(String),
}

/// A frame that could not be turned into the expected message. The frame is
/// dropped; the connection stays up.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("expected {expected} message, got {found}")]
    UnexpectedKind {
        expected: MessageKind,
        found: MessageKind,
    },
}
