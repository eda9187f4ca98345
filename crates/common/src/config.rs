//! Host configuration management
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [device]
//! selector = "0x0ffc:0x0002"
//! serial = "G2-0042"          # optional
//! path = "001:005"            # optional, bus:address
//! interface = 0
//! out_endpoint = 3
//! in_endpoint = 130
//! in_transfer = "bulk"        # or "interrupt"
//!
//! [session]
//! handshake_timeout_ms = 500
//! request_timeout_ms = 1000
//!
//! [framing]
//! max_frame_length = 4096
//! length_width = 2
//! checksum_algorithm = "crc16"
//! ```

use crate::usb_types::{BusPath, DeviceSelector, InTransfer, UsbEndpoints};
use crate::{Error, Result};
use protocol::{ChecksumAlgorithm, FrameCodec, LengthWidth, MIN_BODY_LEN};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "g2-usb";
const CONFIG_FILE: &str = "host.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub framing: FramingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Which device to open and how to talk to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// `VID:PID` in hex
    #[serde(default = "DeviceSettings::default_selector")]
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// `bus:address`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub interface: u8,
    #[serde(default = "DeviceSettings::default_out_endpoint")]
    pub out_endpoint: u8,
    #[serde(default = "DeviceSettings::default_in_endpoint")]
    pub in_endpoint: u8,
    #[serde(default)]
    pub in_transfer: InTransfer,
    /// Only used with `in_transfer = "announced"`
    #[serde(default = "DeviceSettings::default_announce_endpoint")]
    pub announce_endpoint: u8,
    #[serde(default = "DeviceSettings::default_extended_retries")]
    pub extended_retries: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        let endpoints = UsbEndpoints::default();
        Self {
            selector: Self::default_selector(),
            serial: None,
            path: None,
            interface: endpoints.interface,
            out_endpoint: endpoints.out_endpoint,
            in_endpoint: endpoints.in_endpoint,
            in_transfer: endpoints.in_transfer,
            announce_endpoint: endpoints.announce_endpoint,
            extended_retries: endpoints.extended_retries,
        }
    }
}

impl DeviceSettings {
    fn default_selector() -> String {
        DeviceSelector::default().to_string()
    }

    fn default_out_endpoint() -> u8 {
        UsbEndpoints::default().out_endpoint
    }

    fn default_in_endpoint() -> u8 {
        UsbEndpoints::default().in_endpoint
    }

    fn default_announce_endpoint() -> u8 {
        UsbEndpoints::default().announce_endpoint
    }

    fn default_extended_retries() -> u8 {
        UsbEndpoints::default().extended_retries
    }

    /// Build the full selector including serial and bus path filters
    pub fn device_selector(&self) -> Result<DeviceSelector> {
        let mut selector: DeviceSelector = self.selector.parse()?;
        if let Some(serial) = &self.serial {
            selector = selector.with_serial(serial.clone());
        }
        if let Some(path) = &self.path {
            selector = selector.with_path(path.parse::<BusPath>()?);
        }
        Ok(selector)
    }

    pub fn endpoints(&self) -> UsbEndpoints {
        UsbEndpoints {
            interface: self.interface,
            out_endpoint: self.out_endpoint,
            in_endpoint: self.in_endpoint,
            in_transfer: self.in_transfer,
            announce_endpoint: self.announce_endpoint,
            extended_retries: self.extended_retries,
        }
    }
}

/// Session timing and queue limits, all durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Read timeout of one poll in the read loop; bounds shutdown latency
    pub read_poll_ms: u64,
    pub max_read_size: usize,
    pub partial_frame_timeout_ms: u64,
    pub event_queue_capacity: usize,
    /// Consecutive framing errors tolerated before the session faults
    pub max_consecutive_frame_errors: u32,
    pub sequence_space: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 500,
            request_timeout_ms: 1000,
            write_timeout_ms: 1000,
            read_poll_ms: 50,
            max_read_size: 4096,
            partial_frame_timeout_ms: 250,
            event_queue_capacity: 64,
            max_consecutive_frame_errors: 16,
            sequence_space: 1 << 16,
        }
    }
}

impl SessionSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }

    pub fn partial_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_frame_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingSettings {
    pub max_frame_length: usize,
    pub length_width: LengthWidth,
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl Default for FramingSettings {
    fn default() -> Self {
        Self {
            max_frame_length: protocol::DEFAULT_MAX_FRAME_LENGTH,
            length_width: LengthWidth::default(),
            checksum_algorithm: ChecksumAlgorithm::default(),
        }
    }
}

impl FramingSettings {
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(
            self.length_width,
            self.max_frame_length,
            self.checksum_algorithm.build(),
        )
    }
}

impl HostConfig {
    /// Load configuration from `path`, or from the first standard location
    /// that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p),
            None => Self::candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| Error::Config("No configuration file found".to_string()))?,
        };

        let content = fs::read_to_string(&config_path)?;
        let config: HostConfig = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand_path(path);
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join(APP_DIR).join(CONFIG_FILE)
        } else {
            PathBuf::from(".config").join(APP_DIR).join(CONFIG_FILE)
        }
    }

    fn candidate_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc").join(APP_DIR).join(CONFIG_FILE),
        ]
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        self.device.device_selector()?;
        if self.device.in_transfer == InTransfer::Announced && self.device.extended_retries == 0 {
            return Err(Error::Config(
                "extended_retries must be greater than 0 for announced transfers".to_string(),
            ));
        }

        let s = &self.session;
        let timeouts = [
            ("handshake_timeout_ms", s.handshake_timeout_ms),
            ("request_timeout_ms", s.request_timeout_ms),
            ("write_timeout_ms", s.write_timeout_ms),
            ("read_poll_ms", s.read_poll_ms),
            ("partial_frame_timeout_ms", s.partial_frame_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        if s.max_read_size == 0 {
            return Err(Error::Config("max_read_size must be greater than 0".to_string()));
        }
        if s.event_queue_capacity == 0 {
            return Err(Error::Config(
                "event_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if s.sequence_space < 2 || s.sequence_space > 1 << 16 {
            return Err(Error::Config(format!(
                "sequence_space {} out of range 2..=65536",
                s.sequence_space
            )));
        }

        let f = &self.framing;
        if f.max_frame_length < MIN_BODY_LEN {
            return Err(Error::Config(format!(
                "max_frame_length must be at least {}",
                MIN_BODY_LEN
            )));
        }
        if f.max_frame_length > f.length_width.max_body() {
            return Err(Error::Config(format!(
                "max_frame_length {} does not fit a {}-byte length prefix",
                f.max_frame_length,
                f.length_width.bytes()
            )));
        }

        Ok(())
    }
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
