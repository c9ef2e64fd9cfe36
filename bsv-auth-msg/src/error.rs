//! Error types for the bsv-auth-msg crate.

use std::result;
use thiserror::Error;

/// Errors raised while decoding or encoding protocol messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Framing or header layout violation.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A header required by the message variant is absent.
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    /// The message type string is not one of the known variants.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Identity key is not a 33-byte compressed public key.
    #[error("Invalid identity key: {0}")]
    InvalidIdentityKey(String),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Custom Result type for message codec operations.
pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// Shorthand for a framing violation.
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedMessage(message.into())
    }
}
