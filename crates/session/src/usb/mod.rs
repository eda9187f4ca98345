//! USB transport layer
//!
//! Hides endpoint mechanics behind the blocking [`Transport`] trait:
//! - Device discovery by vendor/product id, serial number and bus path
//! - Interface claim/release with kernel driver detach
//! - Bulk, interrupt or interrupt-announced IN reads, bulk OUT writes
//!
//! All calls block; the session layer runs them on a dedicated read thread
//! or on Tokio's blocking pool.

pub mod device;
pub mod transfers;
pub mod transport;

pub use device::{RusbConnector, UsbTransport, find_device, list_devices};
pub use transfers::{Announcement, map_rusb_error, parse_announcement, read_extended};
pub use transport::{Connector, Transport};
