//! Fixed frame prefix with zero-copy parsing.
//!
//! Every frame starts with a 13-byte prefix (big-endian where multi-byte):
//!
//! ```text
//! [0]      version           (u8, currently 1)
//! [1]      msg_type          (u8)
//! [2]      flags             (u8)
//! [3]      compression_algo  (u8)
//! [4]      encryption_algo   (u8)
//! [5..9)   reserved          (u32, zero)
//! [9..13)  payload_len       (u32)
//! ```
//!
//! Depending on the flag bits, one or two additional u32 length words
//! (`metadata_len`, `extra_len`) follow before the body sections. Those are
//! variable, so they are handled by the assembler and codec rather than by
//! this struct.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    errors::{ProtocolError, Result},
    message::{CompressionAlgo, EncryptionAlgo, FrameFlags, MessageType, parse_tags},
};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Raw 13-byte frame prefix in wire layout.
///
/// All fields are byte arrays or single bytes, so every bit pattern is a
/// valid `WirePrefix` and casting from untrusted network bytes is safe.
/// Validation (version, tags) happens in [`WirePrefix::parse`].
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WirePrefix {
    version: u8,
    msg_type: u8,
    flags: u8,
    compression: u8,
    encryption: u8,
    reserved: [u8; 4],
    payload_len: [u8; 4],
}

impl WirePrefix {
    /// Size of the serialized prefix (13 bytes).
    pub const SIZE: usize = 13;

    /// Build a prefix from validated parts.
    #[must_use]
    pub fn new(
        msg_type: MessageType,
        flags: FrameFlags,
        compression: CompressionAlgo,
        encryption: EncryptionAlgo,
        payload_len: u32,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type: msg_type.to_u8(),
            flags: flags.to_byte(),
            compression: compression.to_u8(),
            encryption: encryption.to_u8(),
            reserved: [0; 4],
            payload_len: payload_len.to_be_bytes(),
        }
    }

    /// Parse and validate a prefix from the start of `bytes`.
    ///
    /// Checks run cheapest-first: length, version, then the tag bytes.
    /// The reserved word is not required to be zero on decode (it is always
    /// written as zero), leaving room for future use.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::MalformedFrame`] if fewer than 13 bytes are given
    ///   or any tag byte is unknown
    /// - [`ProtocolError::UnsupportedVersion`] if the version byte is not 1
    pub fn parse(bytes: &[u8]) -> Result<ParsedPrefix> {
        let prefix = Self::ref_from_prefix(bytes)
            .map_err(|_| {
                ProtocolError::malformed(format!(
                    "prefix needs {} bytes, got {}",
                    Self::SIZE,
                    bytes.len()
                ))
            })?
            .0;

        if prefix.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(prefix.version));
        }

        let (msg_type, compression, encryption) =
            parse_tags(prefix.msg_type, prefix.compression, prefix.encryption)?;

        Ok(ParsedPrefix {
            msg_type,
            flags: FrameFlags::from_byte(prefix.flags),
            compression,
            encryption,
            payload_len: u32::from_be_bytes(prefix.payload_len),
        })
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(IntoBytes::as_bytes(self));
        out
    }
}

/// Owned, validated view of a frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPrefix {
    /// Message type tag.
    pub msg_type: MessageType,
    /// Flag bits.
    pub flags: FrameFlags,
    /// Compression algorithm tag.
    pub compression: CompressionAlgo,
    /// Encryption algorithm tag.
    pub encryption: EncryptionAlgo,
    /// On-wire payload section length.
    pub payload_len: u32,
}
