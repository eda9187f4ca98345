//! Integration tests for host configuration files
//!
//! Tests loading, saving and validating `host.toml`, including:
//! - Minimal and full configuration files
//! - Round-trip through save/load
//! - Invalid configuration handling

use common::{DeviceSelector, HostConfig, InTransfer};
use protocol::{ChecksumAlgorithm, LengthWidth};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const MINIMAL_CONFIG: &str = r#"
[device]
selector = "0x0ffc:0x0002"
"#;

const FULL_CONFIG: &str = r#"
[logging]
level = "debug"

[device]
selector = "0x04f9:0x1a2b"
serial = "G2-0042"
path = "003:011"
interface = 1
out_endpoint = 0x01
in_endpoint = 0x81
in_transfer = "interrupt"

[session]
handshake_timeout_ms = 750
request_timeout_ms = 2000
write_timeout_ms = 500
read_poll_ms = 20
max_read_size = 512
partial_frame_timeout_ms = 100
event_queue_capacity = 8
max_consecutive_frame_errors = 4
sequence_space = 256

[framing]
max_frame_length = 1024
length_width = 4
checksum_algorithm = "crc32"
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("host.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_minimal_config_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, MINIMAL_CONFIG);

    let config = HostConfig::load(Some(path)).unwrap();

    assert_eq!(config.logging.level, "info");
    assert_eq!(config.device.device_selector().unwrap(), DeviceSelector::default());
    assert_eq!(config.session.request_timeout(), Duration::from_millis(1000));
    assert_eq!(config.framing.length_width, LengthWidth::Two);
    assert_eq!(config.framing.checksum_algorithm, ChecksumAlgorithm::Crc16);
}

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);

    let config = HostConfig::load(Some(path)).unwrap();

    assert_eq!(config.logging.level, "debug");

    let selector = config.device.device_selector().unwrap();
    assert_eq!(selector.vendor_id, 0x04f9);
    assert_eq!(selector.product_id, 0x1a2b);
    assert_eq!(selector.serial.as_deref(), Some("G2-0042"));
    assert_eq!(selector.path.map(|p| (p.bus, p.address)), Some((3, 11)));

    let endpoints = config.device.endpoints();
    assert_eq!(endpoints.interface, 1);
    assert_eq!(endpoints.out_endpoint, 0x01);
    assert_eq!(endpoints.in_endpoint, 0x81);
    assert_eq!(endpoints.in_transfer, InTransfer::Interrupt);

    assert_eq!(config.session.handshake_timeout(), Duration::from_millis(750));
    assert_eq!(config.session.sequence_space, 256);
    assert_eq!(config.session.event_queue_capacity, 8);

    let codec = config.framing.codec();
    assert_eq!(codec.length_width(), LengthWidth::Four);
    assert_eq!(codec.max_frame_length(), 1024);
    assert_eq!(codec.checksum().width(), 4);
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("host.toml");

    let mut config = HostConfig::default();
    config.logging.level = "trace".to_string();
    config.framing.checksum_algorithm = ChecksumAlgorithm::Xor8;
    config.session.sequence_space = 16;
    config.save(&path).unwrap();

    let loaded = HostConfig::load(Some(path)).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_invalid_length_width_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[framing]\nlength_width = 3\n");
    assert!(HostConfig::load(Some(path)).is_err());
}

#[test]
fn test_unknown_checksum_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[framing]\nchecksum_algorithm = \"md5\"\n");
    assert!(HostConfig::load(Some(path)).is_err());
}

#[test]
fn test_invalid_selector_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[device]\nselector = \"g2\"\n");
    assert!(HostConfig::load(Some(path)).is_err());
}

#[test]
fn test_zero_timeout_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[session]\nhandshake_timeout_ms = 0\n");
    assert!(HostConfig::load(Some(path)).is_err());
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let config = HostConfig::load_or_default(Some(dir.path().join("absent.toml")));
    assert_eq!(config, HostConfig::default());
}
