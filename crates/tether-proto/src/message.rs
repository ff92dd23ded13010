//! Wire tag enums: message types and transform algorithm identifiers.

use crate::errors::ProtocolError;

/// Message type tag carried in byte 1 of every frame.
///
/// `Auth` and `KeepAlive` are control frames consumed by the session layer;
/// the other three reach user code as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// UTF-8 text payload.
    Message = 1,
    /// Serialized object payload; the extra-info section carries its type
    /// descriptor under the `Type` key.
    Object = 2,
    /// Opaque byte payload.
    Bytes = 3,
    /// Identification frame, the first frame a client sends.
    Auth = 4,
    /// Zero-payload liveness frame.
    KeepAlive = 5,
}

impl MessageType {
    /// Parse a wire tag. `None` for unknown values.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Message),
            2 => Some(Self::Object),
            3 => Some(Self::Bytes),
            4 => Some(Self::Auth),
            5 => Some(Self::KeepAlive),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Compression algorithm tag carried in byte 3 of every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionAlgo {
    /// No compression.
    #[default]
    None = 0,
    /// RFC 1952 gzip.
    Gzip = 1,
    /// RFC 1951 raw deflate.
    Deflate = 2,
}

impl CompressionAlgo {
    /// Parse a wire tag. `None` for unknown values.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Deflate),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Encryption algorithm tag carried in byte 4 of every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncryptionAlgo {
    /// No encryption.
    #[default]
    None = 0,
    /// AES-256-CBC with a PBKDF2-derived key and a random per-section IV.
    Aes256Cbc = 1,
}

impl EncryptionAlgo {
    /// Parse a wire tag. `None` for unknown values.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Aes256Cbc),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Frame flag bits carried in byte 2 of every frame.
///
/// Unknown bits are ignored on decode and never set on encode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// A metadata section (and its length word) is present.
    pub has_metadata: bool,
    /// An extra-info section (and its length word) is present.
    pub has_extra_info: bool,
    /// Body sections are compressed.
    pub compressed: bool,
    /// Body sections are encrypted.
    pub encrypted: bool,
}

impl FrameFlags {
    const HAS_METADATA: u8 = 0b0000_0001;
    const HAS_EXTRA_INFO: u8 = 0b0000_0010;
    const COMPRESSED: u8 = 0b0000_0100;
    const ENCRYPTED: u8 = 0b0000_1000;

    /// Parse from the wire byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self {
            has_metadata: byte & Self::HAS_METADATA != 0,
            has_extra_info: byte & Self::HAS_EXTRA_INFO != 0,
            compressed: byte & Self::COMPRESSED != 0,
            encrypted: byte & Self::ENCRYPTED != 0,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.has_metadata {
            byte |= Self::HAS_METADATA;
        }
        if self.has_extra_info {
            byte |= Self::HAS_EXTRA_INFO;
        }
        if self.compressed {
            byte |= Self::COMPRESSED;
        }
        if self.encrypted {
            byte |= Self::ENCRYPTED;
        }
        byte
    }

    /// Number of optional u32 length words that follow the fixed prefix.
    #[must_use]
    pub fn extra_length_words(self) -> usize {
        usize::from(self.has_metadata) + usize::from(self.has_extra_info)
    }
}

/// Parse and validate the three tag bytes together.
///
/// Shared by the contiguous decoder and the streaming assembler so both
/// reject unknown tags identically.
pub(crate) fn parse_tags(
    msg_type: u8,
    compression: u8,
    encryption: u8,
) -> Result<(MessageType, CompressionAlgo, EncryptionAlgo), ProtocolError> {
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| ProtocolError::malformed(format!("unknown message type {msg_type}")))?;
    let compression = CompressionAlgo::from_u8(compression).ok_or_else(|| {
        ProtocolError::malformed(format!("unknown compression algorithm {compression}"))
    })?;
    let encryption = EncryptionAlgo::from_u8(encryption).ok_or_else(|| {
        ProtocolError::malformed(format!("unknown encryption algorithm {encryption}"))
    })?;
    Ok((msg_type, compression, encryption))
}
