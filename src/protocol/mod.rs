//! Hermes wire protocol.
//!
//! A message is a text header block followed by an optional binary body:
//!
//! ```text
//! VERB [unnamed-header]*\n
//! (Key:Value\n)*
//! .\n
//! <body, exactly Content-Length bytes>
//! ```
//!
//! - The first token of the first line is the verb; the remaining tokens are
//!   positional (unnamed) headers.
//! - Each following line is a named header. Keys are case-insensitive.
//! - A line holding a single `.` terminates the block.
//! - `\r` is normalized to a space on receipt, so `\r\n` line endings work.
//! - `Content-Length` announces the body; `Content-Checksum` optionally
//!   carries its MD5 digest.

pub mod checksum;
pub mod message;
pub mod parser;

pub use checksum::Integrity;
pub use message::{Message, MessageError, CONTENT_CHECKSUM, CONTENT_LENGTH};
pub use parser::{encode_header, encoded_len, Codec, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEADER_SIZE};

use std::io;

/// Errors raised while receiving or sending a message.
#[derive(Debug)]
pub enum ProtocolError {
    /// Peer closed the stream before the first byte of a message.
    Closed,
    /// Transfer failure: short read, write error, or socket error.
    Io(io::Error),
    /// No terminator line within the header size limit.
    HeaderTooLarge(usize),
    /// Header block violates the grammar.
    Malformed(String),
    /// Announced body exceeds the configured limit.
    BodyTooLarge { length: usize, limit: usize },
    /// Content-Checksum does not match the received body.
    ChecksumMismatch { expected: String, computed: String },
    /// Message has no verb and cannot be serialized.
    MissingVerb,
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::Malformed(reason.into())
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Closed => write!(f, "Connection closed by peer"),
            ProtocolError::Io(e) => write!(f, "Transfer failed: {}", e),
            ProtocolError::HeaderTooLarge(limit) => {
                write!(f, "Header block exceeds {} bytes without terminator", limit)
            }
            ProtocolError::Malformed(reason) => write!(f, "Malformed message: {}", reason),
            ProtocolError::BodyTooLarge { length, limit } => {
                write!(f, "Body of {} bytes exceeds limit of {} bytes", length, limit)
            }
            ProtocolError::ChecksumMismatch { expected, computed } => write!(
                f,
                "Checksum mismatch: given {} computed {}",
                expected, computed
            ),
            ProtocolError::MissingVerb => write!(f, "Message has no verb"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}
