//! Messaging error types

use hostmesh_crypto::CryptoError;
use thiserror::Error;

pub type WireResult<T> = std::result::Result<T, WireError>;

/// Errors raised while encoding or decoding wire data
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Message type {tag} left {remaining} trailing bytes")]
    TrailingBytes { tag: u8, remaining: usize },

    #[error("Unknown message type tag {0}")]
    UnknownType(u8),

    #[error("Unknown message subject {0}")]
    UnknownSubject(u8),

    #[error("Message type tag {0} is reserved for core messages")]
    ReservedType(u8),

    #[error("Message type tag {0} is already registered")]
    DuplicateType(u8),

    #[error("{0} messages are local only and cannot be encoded")]
    NotWireEncodable(&'static str),

    #[error("Field {field} of {len} bytes exceeds maximum {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid frame length {0}")]
    InvalidLength(i64),

    #[error("Invalid destination count {0}")]
    InvalidDestinationCount(i32),

    #[error("Invalid poison pill cause {0}")]
    InvalidPoisonCause(i32),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error(transparent)]
    Cipher(#[from] CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Unknown tags mean incompatible builds are talking to each other
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::UnknownType(_))
    }
}

/// Errors raised by blocking mailbox receives
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    #[error("Mailbox closed")]
    Closed,
}
