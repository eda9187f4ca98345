//! Integration tests for the frame codec
//!
//! Covers the codec laws with property tests:
//! - round-trip: decode(encode(F)) == F
//! - reassembly does not depend on how bytes are chunked
//! - a single corrupted byte is never accepted as a valid frame
//!
//! Run with: `cargo test -p protocol`

use proptest::prelude::*;
use protocol::{
    ChecksumAlgorithm, Decoded, Frame, FrameCodec, FrameDecoder, LengthWidth, ProtocolError,
    START_MARKER, opcode,
};

fn codec_for(width: LengthWidth, algorithm: ChecksumAlgorithm) -> FrameCodec {
    FrameCodec::new(width, 240, algorithm.build())
}

fn arb_codec() -> impl Strategy<Value = FrameCodec> {
    (
        prop_oneof![
            Just(LengthWidth::One),
            Just(LengthWidth::Two),
            Just(LengthWidth::Four)
        ],
        prop_oneof![
            Just(ChecksumAlgorithm::Crc16),
            Just(ChecksumAlgorithm::Crc32),
            Just(ChecksumAlgorithm::Xor8)
        ],
    )
        .prop_map(|(w, a)| codec_for(w, a))
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    (
        any::<u16>(),
        any::<u8>(),
        proptest::collection::vec(any::<u8>(), 0..200),
    )
        .prop_map(|(seq, op, payload)| Frame::new(seq, op, payload))
}

/// Feed `bytes` in chunks of `chunk` and collect every decoded frame
fn decode_chunked(codec: &FrameCodec, bytes: &[u8], chunk: usize) -> Vec<Frame> {
    let mut decoder = FrameDecoder::new(codec.clone());
    let mut frames = Vec::new();
    for piece in bytes.chunks(chunk.max(1)) {
        decoder.extend(piece);
        frames.extend(decoder.decode_all().into_iter().filter_map(|r| r.ok()));
    }
    frames
}

proptest! {
    #[test]
    fn prop_roundtrip(codec in arb_codec(), frame in arb_frame()) {
        let bytes = codec.encode(&frame).unwrap();
        prop_assert_eq!(codec.decode(&bytes).unwrap(), Decoded::Frame(frame));
    }

    #[test]
    fn prop_chunk_size_independent(
        codec in arb_codec(),
        frames in proptest::collection::vec(arb_frame(), 1..6),
        noise in proptest::collection::vec(any::<u8>(), 0..16),
        chunk in 1usize..64,
    ) {
        let mut bytes = noise;
        for frame in &frames {
            bytes.extend(codec.encode(frame).unwrap());
        }

        let whole = decode_chunked(&codec, &bytes, bytes.len());
        let bytewise = decode_chunked(&codec, &bytes, 1);
        let chunked = decode_chunked(&codec, &bytes, chunk);

        prop_assert_eq!(&whole, &bytewise);
        prop_assert_eq!(&whole, &chunked);
    }

    #[test]
    fn prop_single_byte_corruption_detected(
        codec in arb_codec(),
        frame in arb_frame(),
        index_seed in any::<usize>(),
        flip in 1u8..=255,
    ) {
        let mut bytes = codec.encode(&frame).unwrap();
        // Any byte after the start marker: length, header check, body or checksum
        let index = 1 + index_seed % (bytes.len() - 1);
        bytes[index] ^= flip;

        let result = codec.decode(&bytes);
        let is_checksum_mismatch = matches!(result, Err(ProtocolError::ChecksumMismatch { .. }));
        prop_assert!(is_checksum_mismatch, "unexpected result: {:?}", result);
    }
}

#[test]
fn test_frames_survive_noise_between_them() {
    let codec = FrameCodec::default();
    let a = Frame::new(1, opcode::REQUEST, vec![0x01]);
    let b = Frame::new(2, opcode::REQUEST, vec![0x02]);

    let mut bytes = codec.encode(&a).unwrap();
    bytes.extend([0x00, 0xFF, 0x10]);
    bytes.extend(codec.encode(&b).unwrap());

    assert_eq!(decode_chunked(&codec, &bytes, 3), vec![a, b]);
}

#[test]
fn test_false_start_marker_in_noise() {
    // A stray 0x7E followed by junk must not swallow the real frame that follows
    let codec = FrameCodec::default();
    let real = Frame::new(9, opcode::HANDSHAKE_ACK, vec![1, 0]);

    let mut bytes = vec![START_MARKER, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00];
    bytes.extend(codec.encode(&real).unwrap());

    let mut decoder = codec.decoder();
    decoder.extend(&bytes);
    let results = decoder.decode_all();

    assert!(matches!(
        results.first(),
        Some(Err(ProtocolError::ChecksumMismatch { .. }))
    ));
    let frames: Vec<Frame> = results.into_iter().filter_map(|r| r.ok()).collect();
    assert_eq!(frames, vec![real]);
}

#[test]
fn test_handshake_frames() {
    let codec = FrameCodec::default();
    let hello = Frame::new(0, opcode::HANDSHAKE, vec![1, 0]);
    let bytes = codec.encode(&hello).unwrap();

    assert_eq!(bytes[0], START_MARKER);
    assert_eq!(bytes[6], opcode::HANDSHAKE);
    assert_eq!(codec.decode(&bytes).unwrap(), Decoded::Frame(hello));
}

#[test]
fn test_oversized_declared_length_never_waits() {
    let codec = FrameCodec::new(LengthWidth::Four, 1024, ChecksumAlgorithm::Crc32.build());
    let mut decoder = codec.decoder();
    decoder.extend(&[START_MARKER, 0x7F, 0xFF, 0xFF, 0xFF, 0x7F]);
    assert!(matches!(
        decoder.decode(),
        Err(ProtocolError::MalformedFrame(_))
    ));
    // The length and check bytes carry no marker, so the buffer drains
    assert_eq!(decoder.decode().unwrap(), Decoded::Partial);
    assert_eq!(decoder.buffered(), 0);
}
