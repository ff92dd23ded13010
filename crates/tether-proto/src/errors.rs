//! Wire protocol error types.
//!
//! Every decode path returns one of these; the session layer maps them onto
//! a disconnect reason. We deliberately avoid `std::io::Error` here - frame
//! parsing never touches a socket, and string-free matching on the variant
//! is what the state machine needs.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding, decoding, or reassembling frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unsupported wire protocol version byte.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The frame violates the wire contract: unknown tag, bad length
    /// arithmetic, failed decryption or decompression, invalid key/value
    /// section.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Auth payload was not UTF-8 `name|guid|user_domain|os_version`.
    #[error("malformed auth payload: {0}")]
    MalformedAuth(String),

    /// Declared body length exceeds the configured frame size limit.
    ///
    /// Raised before the body buffer is grown, so an attacker cannot force
    /// an oversize allocation by lying in the length words.
    #[error("frame body of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Total body length declared by the header.
        size: u64,
        /// Configured maximum body length.
        max: usize,
    },

    /// The peer closed the stream in the middle of a frame.
    #[error("unexpected end of stream with {buffered} bytes of partial frame")]
    UnexpectedEof {
        /// Bytes of the partial frame that were already buffered.
        buffered: usize,
    },
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::MalformedFrame`] with a formatted
    /// message.
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}
