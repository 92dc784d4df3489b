//! Transport Errors

use thiserror::Error;

use crate::serializer::SerializationError;

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to the peer could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport has no live stream
    #[error("Not connected")]
    NotConnected,

    /// Framed sends are disabled while raw mode is active
    #[error("Framed send rejected: transport is in raw mode")]
    RawModeActive,

    /// Raw sends need at least one byte
    #[error("Refusing to send an empty raw payload")]
    EmptyPayload,

    /// Writing to the stream failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A frame length exceeds what the codec or the configured limit allows
    #[error("Frame too large: {len} bytes (max: {max})")]
    FrameTooLarge {
        /// Length that was requested or announced
        len: u64,
        /// Largest accepted length
        max: u64,
    },

    /// Payload could not be serialized or deserialized
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error from the underlying socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error means the stream itself is gone
    ///
    /// Used by the read loop to tell an orderly peer close apart from a
    /// transient failure.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::NotConnected => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
