//! Streaming frame reassembly.
//!
//! TCP delivers a byte stream; [`FrameAssembler`] turns arbitrarily chunked
//! reads back into frames. It is a pure push-parser - no I/O - with three
//! states:
//!
//! ```text
//! AwaitHeader ──13 bytes──▶ AwaitBodyLengths ──len words──▶ AwaitBody
//!      ▲                                                        │
//!      └────────────────── frame yielded ◀──total body bytes────┘
//! ```
//!
//! Feeding bytes may yield zero or more complete frames; trailing bytes
//! stay buffered for the next feed. The declared body size is checked
//! against the frame limit *before* the body is buffered, so a hostile
//! length word cannot force an oversize allocation.

use bytes::{Buf, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    frame::Frame,
    header::{ParsedPrefix, WirePrefix},
    transform::FrameKey,
};

/// Default cap on the total body length of a single frame (64 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    AwaitHeader,
    AwaitBodyLengths {
        prefix: ParsedPrefix,
    },
    AwaitBody {
        prefix: ParsedPrefix,
        metadata_len: Option<u32>,
        extra_len: Option<u32>,
        total: usize,
    },
}

/// Reassembles frames from a chunked byte stream.
pub struct FrameAssembler {
    buf: BytesMut,
    state: State,
    max_frame_bytes: usize,
    key: Option<FrameKey>,
}

impl FrameAssembler {
    /// Create an assembler with a frame size limit and optional decryption
    /// key.
    #[must_use]
    pub fn new(max_frame_bytes: usize, key: Option<FrameKey>) -> Self {
        Self { buf: BytesMut::new(), state: State::AwaitHeader, max_frame_bytes, key }
    }

    /// Bytes currently buffered (partial frame plus any unprocessed tail).
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk of stream bytes; returns every frame completed by it.
    ///
    /// On error the assembler is poisoned in the sense that the stream
    /// position is no longer trustworthy; callers close the connection, so
    /// no resynchronization is attempted.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                State::AwaitHeader => {
                    if self.buf.len() < WirePrefix::SIZE {
                        break;
                    }
                    // Validates version and tag bytes; the prefix stays in
                    // the buffer until the length words are known.
                    let prefix = WirePrefix::parse(&self.buf)?;
                    self.state = State::AwaitBodyLengths { prefix };
                },

                State::AwaitBodyLengths { prefix } => {
                    let words = prefix.flags.extra_length_words();
                    let header_len = WirePrefix::SIZE + 4 * words;
                    if self.buf.len() < header_len {
                        break;
                    }

                    let mut offset = WirePrefix::SIZE;
                    let mut next_word = || {
                        let mut word = [0u8; 4];
                        word.copy_from_slice(&self.buf[offset..offset + 4]);
                        offset += 4;
                        u32::from_be_bytes(word)
                    };
                    let metadata_len = prefix.flags.has_metadata.then(&mut next_word);
                    let extra_len = prefix.flags.has_extra_info.then(&mut next_word);

                    let total = u64::from(prefix.payload_len)
                        + u64::from(metadata_len.unwrap_or(0))
                        + u64::from(extra_len.unwrap_or(0));
                    if total > self.max_frame_bytes as u64 {
                        return Err(ProtocolError::FrameTooLarge {
                            size: total,
                            max: self.max_frame_bytes,
                        });
                    }

                    self.buf.advance(header_len);
                    self.state =
                        State::AwaitBody { prefix, metadata_len, extra_len, total: total as usize };
                },

                State::AwaitBody { prefix, metadata_len, extra_len, total } => {
                    if self.buf.len() < total {
                        break;
                    }
                    let body = self.buf.split_to(total);
                    let frame = Frame::from_sections(
                        &prefix,
                        metadata_len,
                        extra_len,
                        &body,
                        self.key.as_ref(),
                        self.max_frame_bytes,
                    )?;
                    frames.push(frame);
                    self.state = State::AwaitHeader;
                },
            }
        }

        Ok(frames)
    }

    /// Signal end of stream.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnexpectedEof`] if a partial frame was buffered
    /// when the peer closed.
    pub fn finish(&self) -> Result<()> {
        let mid_frame = !matches!(self.state, State::AwaitHeader);
        if mid_frame || !self.buf.is_empty() {
            return Err(ProtocolError::UnexpectedEof { buffered: self.buf.len() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kv::KvMap,
        message::{CompressionAlgo, EncryptionAlgo},
    };

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::message("first"),
            Frame::keep_alive(),
            Frame::bytes(vec![0xAB; 5000])
                .with_metadata([("seq", "2")].into_iter().collect::<KvMap>())
                .with_compression(CompressionAlgo::Deflate),
            Frame::message("last").with_callback_key("K"),
        ]
    }

    fn wire_of(frames: &[Frame]) -> Vec<u8> {
        let mut wire = Vec::new();
        for frame in frames {
            wire.extend_from_slice(&frame.encode(None).unwrap());
        }
        wire
    }

    #[test]
    fn single_feed_yields_all_frames() {
        let frames = sample_frames();
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES, None);

        let out = assembler.feed(&wire_of(&frames)).unwrap();
        assert_eq!(out, frames);
        assert_eq!(assembler.buffered(), 0);
        assert!(assembler.finish().is_ok());
    }

    #[test]
    fn one_byte_chunks_yield_all_frames_in_order() {
        let frames = sample_frames();
        let wire = wire_of(&frames);
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES, None);

        let mut out = Vec::new();
        for byte in wire {
            out.extend(assembler.feed(&[byte]).unwrap());
        }
        assert_eq!(out, frames);
        assert!(assembler.finish().is_ok());
    }

    #[test]
    fn ragged_chunks_leave_no_residue() {
        let frames = sample_frames();
        let wire = wire_of(&frames);
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES, None);

        let mut out = Vec::new();
        // Chunk sizes chosen to straddle every boundary kind: mid-prefix,
        // mid-length-word, mid-body.
        for chunk in wire.chunks(7) {
            out.extend(assembler.feed(chunk).unwrap());
        }
        assert_eq!(out, frames);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn partial_frame_at_eof_is_unexpected_eof() {
        let wire = Frame::message("interrupted").encode(None).unwrap();
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES, None);

        assembler.feed(&wire[..wire.len() - 2]).unwrap();
        assert!(matches!(assembler.finish(), Err(ProtocolError::UnexpectedEof { .. })));
    }

    #[test]
    fn oversize_frame_rejected_before_body_buffered() {
        let mut wire = Frame::bytes(vec![1u8; 32]).encode(None).unwrap();
        wire[9..13].copy_from_slice(&(1_000_000u32).to_be_bytes());

        let mut assembler = FrameAssembler::new(1024, None);
        // Only the header arrives; the limit check must fire without
        // waiting for (or allocating) the claimed megabyte.
        let result = assembler.feed(&wire[..WirePrefix::SIZE]);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { size: 1_000_000, .. })));
    }

    #[test]
    fn garbage_header_rejected() {
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES, None);
        let result = assembler.feed(&[0xFFu8; 32]);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(0xFF))));
    }

    #[test]
    fn encrypted_stream_round_trip() {
        let key = FrameKey::derive("stream key");
        let frames =
            vec![Frame::message("sealed one").with_encryption(EncryptionAlgo::Aes256Cbc), Frame::message("sealed two").with_encryption(EncryptionAlgo::Aes256Cbc)];

        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend_from_slice(&frame.encode(Some(&key)).unwrap());
        }

        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES, Some(key));
        let mut out = Vec::new();
        for chunk in wire.chunks(11) {
            out.extend(assembler.feed(chunk).unwrap());
        }
        assert_eq!(out, frames);
    }
}
