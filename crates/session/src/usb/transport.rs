//! Transport abstraction consumed by the session

use crate::error::TransportError;
use common::DeviceSelector;
use protocol::RawPacket;
use std::sync::Arc;
use std::time::Duration;

/// An open endpoint pair on one device.
///
/// Methods take `&self` so a read can be in flight on the read thread while
/// writes are issued from request callers.
pub trait Transport: Send + Sync {
    /// Write `data` to the OUT endpoint, returning the number of bytes written
    fn write_bulk(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read at most `max_len` bytes from the IN endpoint.
    ///
    /// [`TransportError::Timeout`] means no data arrived and is not fatal.
    fn read_bulk(&self, max_len: usize, timeout: Duration) -> Result<RawPacket, TransportError>;

    /// Release the interface and device handle. Closing twice is a no-op.
    fn close(&self);

    /// True once the device has been observed to be gone
    fn is_disconnected(&self) -> bool;
}

/// Opens transports for a device selector
pub trait Connector: Send + Sync {
    fn open(&self, selector: &DeviceSelector) -> Result<Arc<dyn Transport>, TransportError>;
}
