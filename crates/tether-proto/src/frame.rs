//! Frame type and the encode/decode pipeline.
//!
//! A [`Frame`] is one application message: a type tag, a payload, optional
//! metadata and extra-info maps, and the transform tags describing how the
//! body sections travel. Frames are immutable once built; builders cover
//! the common shapes.
//!
//! Wire layout: the 13-byte [`WirePrefix`], then one u32 length word per
//! flagged optional section, then the body sections in order
//! `payload | metadata | extra_info`. Each section is independently
//! compressed and/or encrypted; the length words describe the transformed
//! bytes (see [`crate::transform`]).

use bytes::Bytes;

use crate::{
    auth::AuthPayload,
    errors::{ProtocolError, Result},
    header::{ParsedPrefix, WirePrefix},
    kv::KvMap,
    message::{CompressionAlgo, EncryptionAlgo, FrameFlags, MessageType},
    transform::{self, FrameKey},
};

/// Extra-info key naming a serialized object's type descriptor.
pub const TYPE_KEY: &str = "Type";

/// Extra-info key routing the frame to a registered dynamic callback.
pub const CALLBACK_KEY: &str = "DynamicCallback";

/// One application message on the wire.
///
/// # Invariants
///
/// - Built frames are immutable; builders consume and return `self`.
/// - `decode(encode(frame))` is identity whenever the encode side had the
///   key material it asked for (verified by property tests).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Message type tag.
    pub msg_type: MessageType,
    /// Application payload bytes (plaintext, uncompressed).
    pub payload: Bytes,
    /// Optional metadata map, surfaced verbatim to the peer handler.
    pub metadata: Option<KvMap>,
    /// Optional extra-info map (object type descriptor, callback key).
    pub extra_info: Option<KvMap>,
    /// Compression applied to body sections on the wire.
    pub compression: CompressionAlgo,
    /// Encryption applied to body sections on the wire.
    pub encryption: EncryptionAlgo,
}

impl Frame {
    /// Create a plain frame with no optional sections or transforms.
    #[must_use]
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
            metadata: None,
            extra_info: None,
            compression: CompressionAlgo::None,
            encryption: EncryptionAlgo::None,
        }
    }

    /// UTF-8 text message frame.
    #[must_use]
    pub fn message(text: impl Into<String>) -> Self {
        Self::new(MessageType::Message, text.into().into_bytes())
    }

    /// Opaque byte frame.
    #[must_use]
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Bytes, data)
    }

    /// Serialized object frame; records the type descriptor in extra-info.
    #[must_use]
    pub fn object(payload: impl Into<Bytes>, type_name: impl Into<String>) -> Self {
        let mut extra = KvMap::new();
        extra.insert(TYPE_KEY, type_name.into());
        Self::new(MessageType::Object, payload).with_extra_info(extra)
    }

    /// Identification frame.
    pub fn auth(auth: &AuthPayload) -> Result<Self> {
        Ok(Self::new(MessageType::Auth, auth.encode()?))
    }

    /// Zero-payload liveness frame.
    #[must_use]
    pub fn keep_alive() -> Self {
        Self::new(MessageType::KeepAlive, Bytes::new())
    }

    /// Attach a metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: KvMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach an extra-info map, merging with any existing entries.
    #[must_use]
    pub fn with_extra_info(mut self, extra: KvMap) -> Self {
        match &mut self.extra_info {
            Some(existing) => {
                for (key, value) in extra.iter() {
                    existing.insert(key, value);
                }
            },
            None => self.extra_info = Some(extra),
        }
        self
    }

    /// Route the frame to a named dynamic callback on the receiver.
    #[must_use]
    pub fn with_callback_key(mut self, key: impl Into<String>) -> Self {
        self.extra_info.get_or_insert_with(KvMap::new).insert(CALLBACK_KEY, key.into());
        self
    }

    /// Set the wire compression algorithm.
    #[must_use]
    pub fn with_compression(mut self, algo: CompressionAlgo) -> Self {
        self.compression = algo;
        self
    }

    /// Set the wire encryption algorithm.
    #[must_use]
    pub fn with_encryption(mut self, algo: EncryptionAlgo) -> Self {
        self.encryption = algo;
        self
    }

    /// Dynamic callback key, if the sender attached one.
    #[must_use]
    pub fn callback_key(&self) -> Option<&str> {
        self.extra_info.as_ref().and_then(|e| e.get(CALLBACK_KEY))
    }

    /// Object type descriptor, if present.
    #[must_use]
    pub fn object_type(&self) -> Option<&str> {
        self.extra_info.as_ref().and_then(|e| e.get(TYPE_KEY))
    }

    /// Flag byte derived from the frame's shape.
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags {
            has_metadata: self.metadata.is_some(),
            has_extra_info: self.extra_info.is_some(),
            compressed: self.compression != CompressionAlgo::None,
            encrypted: self.encryption != EncryptionAlgo::None,
        }
    }

    /// Encode the frame to wire bytes.
    ///
    /// If encryption is requested but no key is configured, a warning is
    /// logged and the frame goes out unencrypted with the wire flag
    /// cleared, so the peer does not attempt to decrypt it. This mirrors
    /// the long-standing behavior of the protocol's reference
    /// implementation.
    pub fn encode(&self, key: Option<&FrameKey>) -> Result<Vec<u8>> {
        let encryption = match (self.encryption, key) {
            (EncryptionAlgo::Aes256Cbc, None) => {
                tracing::warn!(
                    msg_type = ?self.msg_type,
                    "encryption requested but no passphrase configured; sending unencrypted"
                );
                EncryptionAlgo::None
            },
            (algo, _) => algo,
        };

        let payload = transform::apply(self.compression, encryption, key, &self.payload)?;
        let metadata = self
            .metadata
            .as_ref()
            .map(|m| transform::apply(self.compression, encryption, key, &m.encode()))
            .transpose()?;
        let extra = self
            .extra_info
            .as_ref()
            .map(|e| transform::apply(self.compression, encryption, key, &e.encode()))
            .transpose()?;

        let payload_len = section_len(&payload)?;

        let flags = FrameFlags {
            has_metadata: metadata.is_some(),
            has_extra_info: extra.is_some(),
            compressed: self.compression != CompressionAlgo::None,
            encrypted: encryption != EncryptionAlgo::None,
        };
        let prefix = WirePrefix::new(self.msg_type, flags, self.compression, encryption, payload_len);

        let mut out = Vec::with_capacity(
            WirePrefix::SIZE
                + 4 * flags.extra_length_words()
                + payload.len()
                + metadata.as_ref().map_or(0, Vec::len)
                + extra.as_ref().map_or(0, Vec::len),
        );
        out.extend_from_slice(&prefix.to_bytes());
        if let Some(metadata) = &metadata {
            out.extend_from_slice(&section_len(metadata)?.to_be_bytes());
        }
        if let Some(extra) = &extra {
            out.extend_from_slice(&section_len(extra)?.to_be_bytes());
        }
        out.extend_from_slice(&payload);
        if let Some(metadata) = &metadata {
            out.extend_from_slice(metadata);
        }
        if let Some(extra) = &extra {
            out.extend_from_slice(extra);
        }
        Ok(out)
    }

    /// Decode a frame from a contiguous buffer.
    ///
    /// Reads exactly one frame from the start of `bytes`; trailing bytes
    /// are ignored. Streaming input goes through
    /// [`FrameAssembler`](crate::FrameAssembler) instead.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnsupportedVersion`] on a foreign version byte
    /// - [`ProtocolError::FrameTooLarge`] if the declared body exceeds
    ///   `max_frame_bytes` (checked before any body allocation)
    /// - [`ProtocolError::MalformedFrame`] on everything else the wire
    ///   contract forbids
    pub fn decode(bytes: &[u8], key: Option<&FrameKey>, max_frame_bytes: usize) -> Result<Self> {
        let prefix = WirePrefix::parse(bytes)?;
        let mut offset = WirePrefix::SIZE;

        let metadata_len = prefix
            .flags
            .has_metadata
            .then(|| read_len_word(bytes, &mut offset, "metadata_len"))
            .transpose()?;
        let extra_len = prefix
            .flags
            .has_extra_info
            .then(|| read_len_word(bytes, &mut offset, "extra_len"))
            .transpose()?;

        let total = u64::from(prefix.payload_len)
            + u64::from(metadata_len.unwrap_or(0))
            + u64::from(extra_len.unwrap_or(0));
        if total > max_frame_bytes as u64 {
            return Err(ProtocolError::FrameTooLarge { size: total, max: max_frame_bytes });
        }

        let body = bytes.get(offset..offset + total as usize).ok_or_else(|| {
            ProtocolError::malformed(format!(
                "body truncated: header declares {total} bytes, {} available",
                bytes.len().saturating_sub(offset)
            ))
        })?;

        Self::from_sections(&prefix, metadata_len, extra_len, body, key, max_frame_bytes)
    }

    /// Assemble a frame from a validated prefix and its exact body bytes.
    ///
    /// `body` must be exactly `payload_len + metadata_len + extra_len`
    /// bytes; the assembler guarantees this before calling in.
    pub(crate) fn from_sections(
        prefix: &ParsedPrefix,
        metadata_len: Option<u32>,
        extra_len: Option<u32>,
        body: &[u8],
        key: Option<&FrameKey>,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        let (payload_wire, rest) = body.split_at(prefix.payload_len as usize);
        let (metadata_wire, extra_wire) = rest.split_at(metadata_len.unwrap_or(0) as usize);
        debug_assert_eq!(extra_wire.len(), extra_len.unwrap_or(0) as usize);

        let invert = |section: &[u8]| {
            transform::invert(prefix.compression, prefix.encryption, key, section, max_frame_bytes)
        };

        let payload = Bytes::from(invert(payload_wire)?);
        let metadata = metadata_len
            .map(|_| invert(metadata_wire).and_then(|raw| KvMap::decode(&raw)))
            .transpose()?;
        let extra_info = extra_len
            .map(|_| invert(extra_wire).and_then(|raw| KvMap::decode(&raw)))
            .transpose()?;

        Ok(Self {
            msg_type: prefix.msg_type,
            payload,
            metadata,
            extra_info,
            compression: prefix.compression,
            encryption: prefix.encryption,
        })
    }
}

fn section_len(section: &[u8]) -> Result<u32> {
    u32::try_from(section.len())
        .map_err(|_| ProtocolError::malformed("section exceeds u32 length field"))
}

fn read_len_word(bytes: &[u8], offset: &mut usize, what: &str) -> Result<u32> {
    let word: [u8; 4] = bytes
        .get(*offset..*offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ProtocolError::malformed(format!("truncated {what} word")))?;
    *offset += 4;
    Ok(u32::from_be_bytes(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 64 * 1024 * 1024;

    #[test]
    fn plain_round_trip() {
        let frame = Frame::message("hello");
        let wire = frame.encode(None).unwrap();
        assert_eq!(Frame::decode(&wire, None, MAX).unwrap(), frame);
    }

    #[test]
    fn metadata_and_extra_round_trip() {
        let frame = Frame::message("hello")
            .with_metadata([("room", "lobby")].into_iter().collect())
            .with_callback_key("K");
        let wire = frame.encode(None).unwrap();

        let decoded = Frame::decode(&wire, None, MAX).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.metadata.as_ref().and_then(|m| m.get("room")), Some("lobby"));
        assert_eq!(decoded.callback_key(), Some("K"));
    }

    #[test]
    fn object_frame_carries_type() {
        let frame = Frame::object(vec![1, 2, 3], "chat::RoomUpdate");
        let wire = frame.encode(None).unwrap();
        assert_eq!(Frame::decode(&wire, None, MAX).unwrap().object_type(), Some("chat::RoomUpdate"));
    }

    #[test]
    fn keep_alive_is_minimal() {
        let wire = Frame::keep_alive().encode(None).unwrap();
        assert_eq!(wire.len(), WirePrefix::SIZE);
        assert_eq!(Frame::decode(&wire, None, MAX).unwrap().msg_type, MessageType::KeepAlive);
    }

    #[test]
    fn compressed_round_trip() {
        let frame = Frame::bytes(vec![7u8; 100_000]).with_compression(CompressionAlgo::Gzip);
        let wire = frame.encode(None).unwrap();
        assert!(wire.len() < 1_000);
        assert_eq!(Frame::decode(&wire, None, MAX).unwrap(), frame);
    }

    #[test]
    fn encrypted_round_trip() {
        let key = FrameKey::derive("swordfish");
        let frame = Frame::message("secret text")
            .with_metadata([("k", "v")].into_iter().collect())
            .with_encryption(EncryptionAlgo::Aes256Cbc);

        let wire = frame.encode(Some(&key)).unwrap();
        assert!(!wire.windows(6).any(|w| w == b"secret"));
        assert_eq!(Frame::decode(&wire, Some(&key), MAX).unwrap(), frame);
    }

    #[test]
    fn missing_passphrase_downgrades_with_warning() {
        let frame = Frame::message("downgraded").with_encryption(EncryptionAlgo::Aes256Cbc);
        let wire = frame.encode(None).unwrap();

        // Wire must say "unencrypted" so the peer does not try to decrypt.
        let decoded = Frame::decode(&wire, None, MAX).unwrap();
        assert_eq!(decoded.encryption, EncryptionAlgo::None);
        assert_eq!(decoded.payload, Bytes::from_static(b"downgraded"));
    }

    #[test]
    fn encrypted_frame_without_key_rejected_on_receive() {
        let key = FrameKey::derive("k");
        let wire = Frame::message("x")
            .with_encryption(EncryptionAlgo::Aes256Cbc)
            .encode(Some(&key))
            .unwrap();
        assert!(matches!(Frame::decode(&wire, None, MAX), Err(ProtocolError::MalformedFrame(_))));
    }

    #[test]
    fn oversize_declared_body_rejected_before_read() {
        let frame = Frame::bytes(vec![0u8; 64]);
        let mut wire = frame.encode(None).unwrap();
        // Forge the payload length word far past the limit.
        wire[9..13].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            Frame::decode(&wire, None, 1024),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_body_rejected() {
        let wire = Frame::message("hello world").encode(None).unwrap();
        assert!(matches!(
            Frame::decode(&wire[..wire.len() - 3], None, MAX),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn trailing_bytes_ignored() {
        let frame = Frame::message("one");
        let mut wire = frame.encode(None).unwrap();
        wire.extend_from_slice(b"trailing garbage");
        assert_eq!(Frame::decode(&wire, None, MAX).unwrap(), frame);
    }
}
