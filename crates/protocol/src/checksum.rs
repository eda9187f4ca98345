//! Frame checksum algorithms
//!
//! Every frame carries a trailing checksum covering the length field and the
//! body. The algorithm is pluggable so one codec serves several device
//! protocol revisions:
//!
//! - [`Crc16Xmodem`]: CRC-16/XMODEM (poly `0x1021`, init `0`). This is what the
//!   G2 synth appends to each bulk message and is the default.
//! - [`Crc32`]: CRC-32 (IEEE) backed by `crc32fast`.
//! - [`Xor8`]: single-byte XOR for very small controllers.
//!
//! Custom algorithms implement [`Checksum`] and are handed to the codec as an
//! `Arc<dyn Checksum>`.
//!
//! # Usage
//!
//! ```
//! use protocol::checksum::{Checksum, ChecksumAlgorithm};
//!
//! let crc = ChecksumAlgorithm::Crc16.build();
//! assert_eq!(crc.width(), 2);
//! assert_eq!(crc.compute(b"123456789"), 0x31C3);
//! ```

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A checksum function over the covered bytes of a frame
pub trait Checksum: fmt::Debug + Send + Sync {
    /// Number of bytes the checksum occupies on the wire (1..=4)
    fn width(&self) -> usize;

    /// Compute the checksum. Only the low `width() * 8` bits are significant.
    fn compute(&self, data: &[u8]) -> u32;

    /// Compute the checksum truncated to its wire width
    fn compute_masked(&self, data: &[u8]) -> u32 {
        mask_to_width(self.compute(data), self.width())
    }

    /// Verify data against an expected checksum
    fn verify(&self, data: &[u8], expected: u32) -> bool {
        self.compute_masked(data) == mask_to_width(expected, self.width())
    }
}

#[inline]
fn mask_to_width(value: u32, width: usize) -> u32 {
    if width >= 4 {
        value
    } else {
        value & ((1u32 << (8 * width)) - 1)
    }
}

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = crc16_table();

/// CRC-16/XMODEM over `data`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[((crc >> 8) as u8 ^ byte) as usize]
    })
}

/// CRC-16/XMODEM
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc16Xmodem;

impl Checksum for Crc16Xmodem {
    fn width(&self) -> usize {
        2
    }

    fn compute(&self, data: &[u8]) -> u32 {
        u32::from(crc16(data))
    }
}

/// CRC-32 (IEEE 802.3)
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32;

impl Checksum for Crc32 {
    fn width(&self) -> usize {
        4
    }

    fn compute(&self, data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }
}

/// XOR of all covered bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct Xor8;

impl Checksum for Xor8 {
    fn width(&self) -> usize {
        1
    }

    fn compute(&self, data: &[u8]) -> u32 {
        u32::from(data.iter().fold(0u8, |acc, &b| acc ^ b))
    }
}

/// Built-in checksum algorithms selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Crc16,
    Crc32,
    Xor8,
}

impl ChecksumAlgorithm {
    /// Instantiate the checksum function
    pub fn build(self) -> Arc<dyn Checksum> {
        match self {
            ChecksumAlgorithm::Crc16 => Arc::new(Crc16Xmodem),
            ChecksumAlgorithm::Crc32 => Arc::new(Crc32),
            ChecksumAlgorithm::Xor8 => Arc::new(Xor8),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChecksumAlgorithm::Crc16 => "crc16",
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Xor8 => "xor8",
        };
        f.write_str(name)
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crc16" | "crc16-xmodem" => Ok(ChecksumAlgorithm::Crc16),
            "crc32" => Ok(ChecksumAlgorithm::Crc32),
            "xor8" | "xor" => Ok(ChecksumAlgorithm::Xor8),
            other => Err(ProtocolError::UnknownChecksum(other.to_string())),
        }
    }
}
