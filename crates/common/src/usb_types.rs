//! USB device selection and endpoint layout

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Clavia vendor id used by the G2
pub const G2_VENDOR_ID: u16 = 0x0ffc;
/// G2 product id
pub const G2_PRODUCT_ID: u16 = 0x0002;

/// Physical location of a device on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusPath {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for BusPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

impl FromStr for BusPath {
    type Err = Error;

    /// Parse `bus:address`, e.g. `1:5` or `001:005`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, address) = s
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("Invalid bus path '{}', expected BUS:ADDR", s)))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u8>()
                .map_err(|_| Error::Config(format!("Invalid bus path '{}'", s)))
        };
        Ok(Self {
            bus: parse(bus)?,
            address: parse(address)?,
        })
    }
}

/// Which device to open.
///
/// Vendor and product ids are mandatory; serial number and bus path narrow
/// the match when several identical devices are attached. When more than one
/// device still matches, the first one enumerated wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<BusPath>,
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::new(G2_VENDOR_ID, G2_PRODUCT_ID)
    }
}

impl DeviceSelector {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            serial: None,
            path: None,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_path(mut self, path: BusPath) -> Self {
        self.path = Some(path);
        self
    }

    /// Check the descriptor-level part of the selector
    pub fn matches_ids(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    pub fn matches_path(&self, bus: u8, address: u8) -> bool {
        self.path
            .map(|p| p.bus == bus && p.address == address)
            .unwrap_or(true)
    }

    pub fn matches_serial(&self, serial: Option<&str>) -> bool {
        match (&self.serial, serial) {
            (None, _) => true,
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial {
            write!(f, " serial={}", serial)?;
        }
        if let Some(path) = &self.path {
            write!(f, " path={}", path)?;
        }
        Ok(())
    }
}

impl FromStr for DeviceSelector {
    type Err = Error;

    /// Parse `VID:PID` with hex ids, `0x` prefix optional
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(Error::Selector(s.to_string()));
        }
        let vendor_id = parse_hex_id(parts[0]).ok_or_else(|| Error::Selector(s.to_string()))?;
        let product_id = parse_hex_id(parts[1]).ok_or_else(|| Error::Selector(s.to_string()))?;
        Ok(Self::new(vendor_id, product_id))
    }
}

fn parse_hex_id(id: &str) -> Option<u16> {
    let hex = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);
    if hex.is_empty() || hex.len() > 4 {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

/// How inbound bytes are read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InTransfer {
    /// Bulk transfers on the IN endpoint
    #[default]
    Bulk,
    /// Interrupt transfers on the IN endpoint
    Interrupt,
    /// The device announces each message on the interrupt endpoint, either
    /// inline or as a size to fetch from the bulk IN endpoint
    Announced,
}

/// Interface and endpoint addresses used by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbEndpoints {
    pub interface: u8,
    pub out_endpoint: u8,
    pub in_endpoint: u8,
    #[serde(default)]
    pub in_transfer: InTransfer,
    /// Interrupt IN endpoint carrying announcements
    #[serde(default = "UsbEndpoints::default_announce_endpoint")]
    pub announce_endpoint: u8,
    /// Bulk reads that may come back empty before an announced message is
    /// given up
    #[serde(default = "UsbEndpoints::default_extended_retries")]
    pub extended_retries: u8,
}

impl UsbEndpoints {
    fn default_announce_endpoint() -> u8 {
        0x81
    }

    fn default_extended_retries() -> u8 {
        5
    }
}

impl Default for UsbEndpoints {
    /// G2 layout: interface 0, bulk OUT 0x03, bulk IN 0x82, interrupt IN 0x81
    fn default() -> Self {
        Self {
            interface: 0,
            out_endpoint: 0x03,
            in_endpoint: 0x82,
            in_transfer: InTransfer::Bulk,
            announce_endpoint: Self::default_announce_endpoint(),
            extended_retries: Self::default_extended_retries(),
        }
    }
}

/// Enumerated device, as shown by `--list-devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub path: BusPath,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parse() {
        let selector: DeviceSelector = "0x0ffc:0x0002".parse().unwrap();
        assert_eq!(selector, DeviceSelector::default());

        let short: DeviceSelector = "04f9:1a2b".parse().unwrap();
        assert_eq!(short.vendor_id, 0x04f9);
        assert_eq!(short.product_id, 0x1a2b);
    }

    #[test]
    fn test_selector_parse_invalid() {
        assert!("0x1234".parse::<DeviceSelector>().is_err());
        assert!("0x1234:0x5678:0x9abc".parse::<DeviceSelector>().is_err());
        assert!("0xGHIJ:0x5678".parse::<DeviceSelector>().is_err());
        assert!("0x12345:0x5678".parse::<DeviceSelector>().is_err());
        assert!("0x:0x5678".parse::<DeviceSelector>().is_err());
    }

    #[test]
    fn test_selector_matching() {
        let selector = DeviceSelector::default()
            .with_serial("G2-0042")
            .with_path(BusPath { bus: 1, address: 7 });

        assert!(selector.matches_ids(0x0ffc, 0x0002));
        assert!(!selector.matches_ids(0x0ffc, 0x0003));
        assert!(selector.matches_path(1, 7));
        assert!(!selector.matches_path(1, 8));
        assert!(selector.matches_serial(Some("G2-0042")));
        assert!(!selector.matches_serial(Some("G2-0043")));
        assert!(!selector.matches_serial(None));

        let open = DeviceSelector::default();
        assert!(open.matches_path(9, 9));
        assert!(open.matches_serial(None));
    }

    #[test]
    fn test_bus_path() {
        let path: BusPath = "001:005".parse().unwrap();
        assert_eq!(path, BusPath { bus: 1, address: 5 });
        assert_eq!(path.to_string(), "001:005");
        assert!("1-5".parse::<BusPath>().is_err());
        assert!("1:300".parse::<BusPath>().is_err());
    }

    #[test]
    fn test_selector_display() {
        let selector = DeviceSelector::new(0x1234, 0xabcd).with_serial("X1");
        assert_eq!(selector.to_string(), "1234:abcd serial=X1");
    }
}
