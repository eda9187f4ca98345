//! Common utilities for g2-usb
//!
//! Shared configuration, device selection types, logging setup and test
//! helpers used by the session crate and the command line tool.

pub mod config;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use config::{DeviceSettings, FramingSettings, HostConfig, LoggingSettings, SessionSettings};
pub use error::{Error, Result};
pub use logging::{init_test_logging, setup_logging};
pub use usb_types::{
    BusPath, DeviceSelector, DeviceSummary, G2_PRODUCT_ID, G2_VENDOR_ID, InTransfer, UsbEndpoints,
};
