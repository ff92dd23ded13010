//! Property-based tests for frame encoding, decoding, and reassembly.
//!
//! These verify the wire contract for ALL inputs rather than hand-picked
//! examples: round-trip identity across every (type, transform, sections)
//! combination, and chunking-independence of the streaming assembler.

use proptest::prelude::*;
use tether_proto::{
    CompressionAlgo, DEFAULT_MAX_FRAME_BYTES, EncryptionAlgo, Frame, FrameAssembler, FrameKey,
    KvMap, MessageType,
};

fn arbitrary_message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Message),
        Just(MessageType::Object),
        Just(MessageType::Bytes),
        Just(MessageType::Auth),
        Just(MessageType::KeepAlive),
    ]
}

fn arbitrary_compression() -> impl Strategy<Value = CompressionAlgo> {
    prop_oneof![
        Just(CompressionAlgo::None),
        Just(CompressionAlgo::Gzip),
        Just(CompressionAlgo::Deflate),
    ]
}

fn arbitrary_kv() -> impl Strategy<Value = KvMap> {
    prop::collection::vec(("[a-z]{1,8}", "\\PC{0,16}"), 0..4)
        .prop_map(|pairs| pairs.into_iter().collect())
}

fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (
        arbitrary_message_type(),
        prop::collection::vec(any::<u8>(), 0..512),
        prop::option::of(arbitrary_kv()),
        prop::option::of(arbitrary_kv()),
        arbitrary_compression(),
        any::<bool>(),
    )
        .prop_map(|(msg_type, payload, metadata, extra, compression, encrypted)| {
            let mut frame = Frame::new(msg_type, payload).with_compression(compression);
            if let Some(metadata) = metadata {
                frame = frame.with_metadata(metadata);
            }
            if let Some(extra) = extra {
                frame = frame.with_extra_info(extra);
            }
            if encrypted {
                frame = frame.with_encryption(EncryptionAlgo::Aes256Cbc);
            }
            frame
        })
}

fn key() -> FrameKey {
    // One derivation for the whole test binary; 10k PBKDF2 rounds per case
    // would drown the property runs.
    static KEY: std::sync::OnceLock<FrameKey> = std::sync::OnceLock::new();
    KEY.get_or_init(|| FrameKey::derive("property-test passphrase")).clone()
}

proptest! {
    #[test]
    fn frame_round_trip(frame in arbitrary_frame()) {
        let key = key();
        let wire = frame.encode(Some(&key)).expect("encode should succeed");
        let decoded = Frame::decode(&wire, Some(&key), DEFAULT_MAX_FRAME_BYTES)
            .expect("decode should succeed");
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn chunking_never_changes_the_result(
        frames in prop::collection::vec(arbitrary_frame(), 1..5),
        chunk_size in 1usize..64,
    ) {
        let key = key();
        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend_from_slice(&frame.encode(Some(&key)).expect("encode should succeed"));
        }

        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES, Some(key));
        let mut out = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            out.extend(assembler.feed(chunk).expect("feed should succeed"));
        }

        prop_assert_eq!(out, frames);
        prop_assert_eq!(assembler.buffered(), 0);
        prop_assert!(assembler.finish().is_ok());
    }

    #[test]
    fn decode_never_panics_on_garbage(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        // Arbitrary input must produce Ok or Err, never a panic.
        let _ = Frame::decode(&bytes, None, DEFAULT_MAX_FRAME_BYTES);

        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES, None);
        let _ = assembler.feed(&bytes);
    }
}

/// Size extremes: empty, one byte, and a megabyte payload.
#[test]
fn size_extremes_round_trip() {
    let key = FrameKey::derive("size extremes");
    for payload in [vec![], vec![0x42], vec![0x5A; 1024 * 1024]] {
        for compression in
            [CompressionAlgo::None, CompressionAlgo::Gzip, CompressionAlgo::Deflate]
        {
            for encryption in [EncryptionAlgo::None, EncryptionAlgo::Aes256Cbc] {
                let frame = Frame::bytes(payload.clone())
                    .with_compression(compression)
                    .with_encryption(encryption);
                let wire = frame.encode(Some(&key)).expect("encode");
                let decoded =
                    Frame::decode(&wire, Some(&key), DEFAULT_MAX_FRAME_BYTES).expect("decode");
                assert_eq!(decoded, frame, "{compression:?}/{encryption:?}");
            }
        }
    }
}

/// Different passphrases must not interoperate.
#[test]
fn passphrase_mismatch_fails_decode() {
    let sender = FrameKey::derive("alpha");
    let receiver = FrameKey::derive("bravo");

    let frame = Frame::message("confidential")
        .with_metadata([("room", "lobby")].into_iter().collect::<KvMap>())
        .with_encryption(EncryptionAlgo::Aes256Cbc);
    let wire = frame.encode(Some(&sender)).expect("encode");

    assert!(Frame::decode(&wire, Some(&receiver), DEFAULT_MAX_FRAME_BYTES).is_err());
}
