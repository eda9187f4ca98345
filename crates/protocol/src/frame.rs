//! Frame and raw packet types

use std::fmt;
use std::time::Instant;

/// Sequence id carried by every frame
pub type SequenceId = u16;

/// Opcodes with a fixed meaning in the session layer.
///
/// Everything else is opaque to the core and belongs to the device command set.
pub mod opcode {
    /// Host -> device handshake, payload `[major, minor]`
    pub const HANDSHAKE: u8 = 0x00;
    /// Device -> host handshake acknowledgement, payload `[major, minor]`
    pub const HANDSHAKE_ACK: u8 = 0x01;
    /// Default opcode for generic requests
    pub const REQUEST: u8 = 0x02;
}

/// A decoded protocol unit.
///
/// A `Frame` obtained from the decoder has already passed checksum
/// validation; frames that fail it are reported as errors and never built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    pub seq: SequenceId,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(seq: SequenceId, opcode: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            opcode,
            payload: payload.into(),
        }
    }

    /// Body length on the wire: sequence id + opcode + payload
    pub fn body_len(&self) -> usize {
        crate::codec::MIN_BODY_LEN + self.payload.len()
    }

    pub fn is_handshake_ack(&self) -> bool {
        self.opcode == opcode::HANDSHAKE_ACK
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq={} opcode={:#04x} len={}",
            self.seq,
            self.opcode,
            self.payload.len()
        )
    }
}

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Bytes delivered by (or handed to) one USB transfer
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Vec<u8>,
    pub direction: Direction,
    pub timestamp: Instant,
}

impl RawPacket {
    pub fn inbound(data: Vec<u8>) -> Self {
        Self {
            data,
            direction: Direction::In,
            timestamp: Instant::now(),
        }
    }

    pub fn outbound(data: Vec<u8>) -> Self {
        Self {
            data,
            direction: Direction::Out,
            timestamp: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Render a buffer as rows of 16 hex bytes followed by their ASCII form
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for chunk in data.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        out.push_str(&format!("{:<47}  {}\n", hex.join(" "), ascii));
    }
    out
}
