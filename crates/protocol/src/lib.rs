//! Wire protocol for talking to a G2-style USB synth
//!
//! This crate turns frames into bytes and back. It knows nothing about USB:
//! the session layer hands it the raw bytes of each transfer and receives
//! checksum-verified [`Frame`]s.
//!
//! # Example
//!
//! ```
//! use protocol::{Decoded, Frame, FrameCodec, opcode};
//!
//! let codec = FrameCodec::default();
//! let frame = Frame::new(5, opcode::REQUEST, vec![0x01, 0x02]);
//! let bytes = codec.encode(&frame).unwrap();
//!
//! // Bytes may arrive split across transfers
//! let mut decoder = codec.decoder();
//! decoder.extend(&bytes[..4]);
//! assert_eq!(decoder.decode().unwrap(), Decoded::Partial);
//! decoder.extend(&bytes[4..]);
//! assert_eq!(decoder.decode().unwrap(), Decoded::Frame(frame));
//! ```

pub mod checksum;
pub mod codec;
pub mod error;
pub mod frame;
pub mod version;

pub use checksum::{Checksum, ChecksumAlgorithm, Crc16Xmodem, Crc32, Xor8};
pub use codec::{
    DEFAULT_MAX_FRAME_LENGTH, Decoded, FrameCodec, FrameDecoder, LengthWidth, MIN_BODY_LEN,
    START_MARKER, header_check,
};
pub use error::{Malformation, ProtocolError, Result};
pub use frame::{Direction, Frame, RawPacket, SequenceId, hex_dump, opcode};
pub use version::{CURRENT_VERSION, ProtocolVersion, validate_version};
