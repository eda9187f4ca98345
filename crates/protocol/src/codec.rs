//! Frame encoding and incremental decoding
//!
//! # Frame Format
//!
//! ```text
//! [0x7E][length: W bytes BE][hcheck: u8][seq: u16 BE][opcode: u8][payload ...][checksum: C bytes BE]
//! ```
//!
//! `length` counts the body (`seq + opcode + payload`). `hcheck` is the
//! complement of the XOR of the length bytes, so a damaged length is caught
//! before the decoder trusts it. The checksum covers everything between the
//! start marker and the checksum itself. `W` is the configured
//! [`LengthWidth`] and `C` the width of the configured [`Checksum`].
//!
//! A single USB transfer may carry part of a frame or several frames, so
//! decoding runs over an accumulating buffer: [`FrameDecoder::extend`] appends
//! transfer bytes and [`FrameDecoder::decode`] yields one frame at a time or
//! [`Decoded::Partial`]. A bad header or checksum drops the start marker and
//! the next call resumes at the following `0x7E`.

use crate::checksum::{Checksum, ChecksumAlgorithm};
use crate::error::{Malformation, ProtocolError, Result};
use crate::frame::Frame;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// First byte of every frame
pub const START_MARKER: u8 = 0x7E;

/// Smallest legal body: sequence id (2) + opcode (1)
pub const MIN_BODY_LEN: usize = 3;

/// Complement of the XOR of the length prefix bytes
pub fn header_check(length: &[u8]) -> u8 {
    !length.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Default upper bound on the declared body length
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4096;

/// Width of the big-endian length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LengthWidth {
    One,
    #[default]
    Two,
    Four,
}

impl LengthWidth {
    pub fn bytes(self) -> usize {
        match self {
            LengthWidth::One => 1,
            LengthWidth::Two => 2,
            LengthWidth::Four => 4,
        }
    }

    /// Largest body length the prefix can express
    pub fn max_body(self) -> usize {
        match self {
            LengthWidth::One => u8::MAX as usize,
            LengthWidth::Two => u16::MAX as usize,
            LengthWidth::Four => u32::MAX as usize,
        }
    }
}

impl TryFrom<u8> for LengthWidth {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LengthWidth::One),
            2 => Ok(LengthWidth::Two),
            4 => Ok(LengthWidth::Four),
            other => Err(ProtocolError::UnsupportedLengthWidth(other)),
        }
    }
}

impl From<LengthWidth> for u8 {
    fn from(width: LengthWidth) -> u8 {
        width.bytes() as u8
    }
}

/// Result of a decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, checksum-verified frame
    Frame(Frame),
    /// The buffer holds no complete frame yet
    Partial,
}

/// Encoder/decoder parameters shared by both directions
#[derive(Clone)]
pub struct FrameCodec {
    length_width: LengthWidth,
    max_frame_length: usize,
    checksum: Arc<dyn Checksum>,
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("length_width", &self.length_width)
            .field("max_frame_length", &self.max_frame_length)
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(
            LengthWidth::default(),
            DEFAULT_MAX_FRAME_LENGTH,
            ChecksumAlgorithm::default().build(),
        )
    }
}

impl FrameCodec {
    /// Create a codec. `max_frame_length` is clamped to what the length
    /// prefix can express.
    pub fn new(
        length_width: LengthWidth,
        max_frame_length: usize,
        checksum: Arc<dyn Checksum>,
    ) -> Self {
        Self {
            length_width,
            max_frame_length: max_frame_length.min(length_width.max_body()),
            checksum,
        }
    }

    pub fn length_width(&self) -> LengthWidth {
        self.length_width
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub fn checksum(&self) -> &Arc<dyn Checksum> {
        &self.checksum
    }

    /// Start marker, length prefix and header check byte
    pub fn header_len(&self) -> usize {
        1 + self.length_width.bytes() + 1
    }

    /// Total encoded size of a frame with the given payload length
    pub fn encoded_len(&self, payload_len: usize) -> usize {
        self.header_len() + MIN_BODY_LEN + payload_len + self.checksum.width()
    }

    /// Encode a frame. Deterministic: equal frames encode to equal bytes.
    ///
    /// # Example
    /// ```
    /// use protocol::{Frame, FrameCodec, START_MARKER};
    ///
    /// let codec = FrameCodec::default();
    /// let bytes = codec.encode(&Frame::new(5, 0x02, vec![0x01, 0x02])).unwrap();
    /// assert_eq!(bytes[0], START_MARKER);
    /// assert_eq!(&bytes[1..3], &[0x00, 0x05]); // body length
    /// ```
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let body_len = frame.body_len();
        if body_len > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_length,
            });
        }

        let width = self.length_width.bytes();
        let checksum_width = self.checksum.width();
        let mut out = vec![0u8; self.encoded_len(frame.payload.len())];

        out[0] = START_MARKER;
        BigEndian::write_uint(&mut out[1..1 + width], body_len as u64, width);
        out[1 + width] = header_check(&out[1..1 + width]);

        let body_start = self.header_len();
        BigEndian::write_u16(&mut out[body_start..body_start + 2], frame.seq);
        out[body_start + 2] = frame.opcode;
        out[body_start + MIN_BODY_LEN..body_start + body_len].copy_from_slice(&frame.payload);

        let covered_end = body_start + body_len;
        let checksum = self.checksum.compute_masked(&out[1..covered_end]);
        BigEndian::write_uint(
            &mut out[covered_end..covered_end + checksum_width],
            u64::from(checksum),
            checksum_width,
        );

        Ok(out)
    }

    /// Decode the first frame of a standalone buffer
    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded> {
        let mut decoder = self.decoder();
        decoder.extend(bytes);
        decoder.decode()
    }

    /// New incremental decoder using these parameters
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.clone())
    }
}

/// Incremental decoder over an accumulating byte buffer
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: BytesMut,
    skipped: u64,
}

impl FrameDecoder {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(512),
            skipped: 0,
        }
    }

    /// Append bytes from a transfer
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held awaiting completion
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard everything buffered, returning how many bytes were dropped
    pub fn reset(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.skipped += dropped as u64;
        dropped
    }

    /// Bytes skipped while resynchronising since the last call
    pub fn take_skipped(&mut self) -> u64 {
        std::mem::take(&mut self.skipped)
    }

    /// Try to take one frame from the front of the buffer.
    ///
    /// Returns [`Decoded::Partial`] when more bytes are needed. On
    /// [`ProtocolError::ChecksumMismatch`] or [`ProtocolError::MalformedFrame`]
    /// the offending start marker is consumed, so calling again continues
    /// with the next candidate frame.
    pub fn decode(&mut self) -> Result<Decoded> {
        if !self.seek_start_marker() {
            return Ok(Decoded::Partial);
        }

        let header_len = self.codec.header_len();
        if self.buffer.len() < header_len {
            return Ok(Decoded::Partial);
        }

        let width = self.codec.length_width.bytes();
        let declared = BigEndian::read_uint(&self.buffer[1..1 + width], width) as usize;
        let expected = self.buffer[1 + width];
        let computed = header_check(&self.buffer[1..1 + width]);
        if expected != computed {
            self.drop_start_marker();
            return Err(ProtocolError::ChecksumMismatch {
                expected: u32::from(expected),
                computed: u32::from(computed),
            });
        }

        if declared > self.codec.max_frame_length {
            self.drop_start_marker();
            return Err(ProtocolError::MalformedFrame(
                Malformation::LengthExceedsMax {
                    declared,
                    max: self.codec.max_frame_length,
                },
            ));
        }
        if declared < MIN_BODY_LEN {
            self.drop_start_marker();
            return Err(ProtocolError::MalformedFrame(
                Malformation::LengthBelowMinimum {
                    declared,
                    min: MIN_BODY_LEN,
                },
            ));
        }

        let checksum_width = self.codec.checksum.width();
        let covered_end = header_len + declared;
        let total = covered_end + checksum_width;
        if self.buffer.len() < total {
            return Ok(Decoded::Partial);
        }

        let expected = BigEndian::read_uint(&self.buffer[covered_end..total], checksum_width) as u32;
        let computed = self.codec.checksum.compute_masked(&self.buffer[1..covered_end]);
        if expected != computed {
            self.drop_start_marker();
            return Err(ProtocolError::ChecksumMismatch { expected, computed });
        }

        let body = &self.buffer[header_len..covered_end];
        let frame = Frame {
            seq: BigEndian::read_u16(&body[0..2]),
            opcode: body[2],
            payload: body[MIN_BODY_LEN..].to_vec(),
        };
        self.buffer.advance(total);

        Ok(Decoded::Frame(frame))
    }

    /// Decode until the buffer runs dry, collecting frames and anomalies in
    /// arrival order
    pub fn decode_all(&mut self) -> Vec<Result<Frame>> {
        let mut out = Vec::new();
        loop {
            match self.decode() {
                Ok(Decoded::Frame(frame)) => out.push(Ok(frame)),
                Ok(Decoded::Partial) => break,
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Drop leading bytes until the buffer starts with a start marker.
    /// Returns false if the buffer holds no marker at all.
    fn seek_start_marker(&mut self) -> bool {
        match self.buffer.iter().position(|&b| b == START_MARKER) {
            Some(0) => true,
            Some(pos) => {
                self.buffer.advance(pos);
                self.skipped += pos as u64;
                true
            }
            None => {
                self.skipped += self.buffer.len() as u64;
                self.buffer.clear();
                false
            }
        }
    }

    fn drop_start_marker(&mut self) {
        self.buffer.advance(1);
        self.skipped += 1;
    }
}
