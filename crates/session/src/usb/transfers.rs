//! USB transfer execution
//!
//! Synchronous IN/OUT transfers on an open handle, with rusb errors mapped to
//! [`TransportError`].
//!
//! # Announced reads
//!
//! In [`InTransfer::Announced`] mode the device first sends a short header on
//! the interrupt endpoint. The low nibble of its first byte is the type:
//!
//! - `2` embedded: the high nibble is the message length and the message
//!   follows the type byte inline
//! - `1` extended: a big-endian `u16` size follows the type byte, and the
//!   message is then read from the bulk IN endpoint

use crate::error::TransportError;
use common::{InTransfer, UsbEndpoints};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Size of the interrupt transfer carrying an announcement
pub const ANNOUNCE_HEADER_LEN: usize = 16;

/// Timeout of each bulk read fetching an extended message
pub const EXTENDED_READ_TIMEOUT: Duration = Duration::from_secs(1);

const ANNOUNCE_EXTENDED: u8 = 0x01;
const ANNOUNCE_EMBEDDED: u8 = 0x02;

/// Decoded interrupt header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// Message carried inline in the header
    Embedded(Vec<u8>),
    /// Message of this many bytes waiting on the bulk IN endpoint
    Extended(usize),
    /// Unknown type or a header too short to use
    Ignored,
}

/// Parse an interrupt header. An embedded length longer than the header is
/// truncated to the bytes present; the frame decoder rejects what is left.
pub fn parse_announcement(header: &[u8]) -> Announcement {
    let Some(&first) = header.first() else {
        return Announcement::Ignored;
    };

    match first & 0x0f {
        ANNOUNCE_EXTENDED if header.len() >= 3 => {
            match u16::from_be_bytes([header[1], header[2]]) as usize {
                0 => Announcement::Ignored,
                size => Announcement::Extended(size),
            }
        }
        ANNOUNCE_EMBEDDED => {
            let end = (1 + (first >> 4) as usize).min(header.len());
            if end <= 1 {
                Announcement::Ignored
            } else {
                Announcement::Embedded(header[1..end].to_vec())
            }
        }
        _ => Announcement::Ignored,
    }
}

/// Collect an extended message of `size` bytes.
///
/// `read` performs one bulk read; empty reads and timeouts count against
/// `retries`, other errors abort. Returns what arrived if the retries run out
/// after a partial read, and `Timeout` if nothing arrived at all.
pub fn read_extended<F>(size: usize, retries: u8, mut read: F) -> Result<Vec<u8>, TransportError>
where
    F: FnMut(&mut [u8]) -> Result<usize, TransportError>,
{
    let mut message = vec![0u8; size];
    let mut filled = 0;
    let mut misses = 0;

    while filled < size && misses < retries {
        match read(&mut message[filled..]) {
            Ok(0) | Err(TransportError::Timeout) => {
                misses += 1;
                debug!(
                    "Extended read got nothing ({}/{} retries)",
                    misses, retries
                );
            }
            Ok(n) => filled += n.min(size - filled),
            Err(e) => return Err(e),
        }
    }

    if filled < size {
        warn!("Extended message incomplete: {} of {} bytes", filled, size);
        if filled == 0 {
            return Err(TransportError::Timeout);
        }
    }
    message.truncate(filled);
    Ok(message)
}

/// Wait for an announcement and return the message it carries or points to.
///
/// An ignored announcement yields an empty message.
pub fn read_announced(
    handle: &DeviceHandle<Context>,
    endpoints: &UsbEndpoints,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; ANNOUNCE_HEADER_LEN];
    let len = handle
        .read_interrupt(endpoints.announce_endpoint, &mut header, timeout)
        .map_err(map_rusb_error)?;
    trace!(
        "Announcement on {:#x}: {:02x?}",
        endpoints.announce_endpoint,
        &header[..len]
    );

    match parse_announcement(&header[..len]) {
        Announcement::Embedded(message) => Ok(message),
        Announcement::Extended(size) => {
            read_extended(size, endpoints.extended_retries, |buffer| {
                handle
                    .read_bulk(endpoints.in_endpoint, buffer, EXTENDED_READ_TIMEOUT)
                    .map_err(map_rusb_error)
            })
        }
        Announcement::Ignored => {
            debug!("Ignoring announcement {:02x?}", &header[..len]);
            Ok(Vec::new())
        }
    }
}

/// Read one transfer from the IN endpoint into `buffer`. Announced mode
/// reads the bulk endpoint directly here; see [`read_announced`].
pub fn read_in(
    handle: &DeviceHandle<Context>,
    endpoints: &UsbEndpoints,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<usize, TransportError> {
    let result = match endpoints.in_transfer {
        InTransfer::Bulk | InTransfer::Announced => {
            handle.read_bulk(endpoints.in_endpoint, buffer, timeout)
        }
        InTransfer::Interrupt => handle.read_interrupt(endpoints.in_endpoint, buffer, timeout),
    };

    match result {
        Ok(len) => {
            trace!(
                "IN transfer: endpoint={:#x}, {} bytes",
                endpoints.in_endpoint, len
            );
            Ok(len)
        }
        Err(e) => Err(map_rusb_error(e)),
    }
}

/// Write `data` to the bulk OUT endpoint
pub fn write_out(
    handle: &DeviceHandle<Context>,
    endpoints: &UsbEndpoints,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, TransportError> {
    let written = handle
        .write_bulk(endpoints.out_endpoint, data, timeout)
        .map_err(map_rusb_error)?;

    trace!(
        "OUT transfer: endpoint={:#x}, {} of {} bytes",
        endpoints.out_endpoint,
        written,
        data.len()
    );

    if written < data.len() {
        return Err(TransportError::Io(format!(
            "short write: {} of {} bytes",
            written,
            data.len()
        )));
    }
    Ok(written)
}

/// Map rusb::Error to TransportError
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::NoDevice => TransportError::Disconnected,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Access => TransportError::PermissionDenied,
        _ => TransportError::Io(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(
            map_rusb_error(rusb::Error::NoDevice),
            TransportError::Disconnected
        );
        assert_eq!(map_rusb_error(rusb::Error::Busy), TransportError::Busy);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), TransportError::NotFound);
        assert_eq!(
            map_rusb_error(rusb::Error::Access),
            TransportError::PermissionDenied
        );
        assert!(matches!(
            map_rusb_error(rusb::Error::Pipe),
            TransportError::Io(_)
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Overflow),
            TransportError::Io(_)
        ));
    }

    #[test]
    fn test_parse_embedded_announcement() {
        // Length 5 in the high nibble, type 2
        let header = [0x52, 0x7E, 0x00, 0x03, 0xFC, 0x01, 0x00, 0x00];
        assert_eq!(
            parse_announcement(&header),
            Announcement::Embedded(vec![0x7E, 0x00, 0x03, 0xFC, 0x01])
        );

        // Claims 8 bytes but the transfer holds 5
        assert_eq!(
            parse_announcement(&[0x82, 0x01, 0x0c, 0x40, 0x36, 0x04]),
            Announcement::Embedded(vec![0x01, 0x0c, 0x40, 0x36, 0x04])
        );
    }

    #[test]
    fn test_parse_extended_announcement() {
        assert_eq!(
            parse_announcement(&[0x01, 0x01, 0x20, 0x00]),
            Announcement::Extended(0x120)
        );
        assert_eq!(parse_announcement(&[0x01, 0x00, 0x00]), Announcement::Ignored);
        assert_eq!(parse_announcement(&[0x01, 0x00]), Announcement::Ignored);
    }

    #[test]
    fn test_parse_unknown_announcement() {
        assert_eq!(parse_announcement(&[]), Announcement::Ignored);
        assert_eq!(parse_announcement(&[0x03, 0x01]), Announcement::Ignored);
        assert_eq!(parse_announcement(&[0x02, 0x01]), Announcement::Ignored);
    }

    #[test]
    fn test_read_extended_retries_empty_reads() {
        let mut replies = vec![
            Err(TransportError::Timeout),
            Ok(vec![1, 2, 3]),
            Ok(Vec::new()),
            Ok(vec![4, 5]),
        ]
        .into_iter();

        let message = read_extended(5, 3, |buffer| match replies.next() {
            Some(Ok(bytes)) => {
                buffer[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Timeout),
        })
        .unwrap();
        assert_eq!(message, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_read_extended_gives_up() {
        let mut calls = 0;
        let result = read_extended(4, 2, |_| {
            calls += 1;
            Err(TransportError::Timeout)
        });
        assert_eq!(result, Err(TransportError::Timeout));
        assert_eq!(calls, 2);

        // Partial data is handed on when the retries run out
        let mut first = true;
        let partial = read_extended(4, 2, |buffer| {
            if std::mem::take(&mut first) {
                buffer[0] = 9;
                Ok(1)
            } else {
                Ok(0)
            }
        });
        assert_eq!(partial, Ok(vec![9]));
    }

    #[test]
    fn test_read_extended_aborts_on_fatal_error() {
        let result = read_extended(4, 5, |_| Err(TransportError::Disconnected));
        assert_eq!(result, Err(TransportError::Disconnected));
    }

    #[test]
    fn test_endpoint_direction() {
        let endpoints = UsbEndpoints::default();
        assert!((endpoints.in_endpoint & 0x80) != 0);
        assert!((endpoints.announce_endpoint & 0x80) != 0);
        assert!((endpoints.out_endpoint & 0x80) == 0);
    }
}
