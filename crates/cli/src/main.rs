//! g2-usb command line tool
//!
//! Connects to a G2 device over USB, performs the version handshake, issues
//! one request and then prints device events until interrupted.

use anyhow::{Context, Result, bail};
use clap::Parser;
use common::{DeviceSelector, HostConfig, setup_logging};
use session::usb::{RusbConnector, list_devices};
use session::{Dispatcher, Session, SessionConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "g2-usb")]
#[command(author, version, about = "Talk to a G2 device over USB")]
#[command(long_about = "
Opens a G2 device over USB, performs the protocol handshake and exchanges
framed request/response messages with it.

EXAMPLES:
    # Connect with default config and ping the device
    g2-usb

    # Send a request with a custom payload
    g2-usb --payload 01020a

    # Select a device by id
    g2-usb --device 0ffc:0002

    # List USB devices without connecting
    g2-usb --list-devices

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/g2-usb/host.toml
    3. /etc/g2-usb/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Device to open as VID:PID in hex, overriding the config
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<DeviceSelector>,

    /// Request payload as hex bytes
    #[arg(short, long, value_name = "HEX", default_value = "")]
    payload: String,

    /// Exit after the request instead of streaming events
    #[arg(long)]
    no_events: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = HostConfig::default_path();
        HostConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(path) = &args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default(None)
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("g2-usb v{}", env!("CARGO_PKG_VERSION"));

    let connector = Arc::new(
        RusbConnector::new(config.device.endpoints()).context("Failed to initialise libusb")?,
    );

    if args.list_devices {
        return list_devices_mode(&connector);
    }

    let selector = match args.device.clone() {
        Some(selector) => selector,
        None => config
            .device
            .device_selector()
            .context("Invalid device selector in configuration")?,
    };
    let payload = parse_hex(&args.payload).context("Invalid --payload")?;

    let session = Arc::new(Session::new(
        connector,
        selector,
        SessionConfig::from(&config),
    ));
    let result = run(&session, payload, !args.no_events).await;

    if let Err(e) = session.close().await {
        error!("Error closing session: {:#}", e);
    }
    println!("{}", session.stats());

    result
}

fn list_devices_mode(connector: &RusbConnector) -> Result<()> {
    let devices = list_devices(connector.context()).context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x} - {} {}",
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        println!("      Bus/Device {}", device.path);
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
        println!();
    }
    Ok(())
}

async fn run(session: &Arc<Session>, payload: Vec<u8>, stream_events: bool) -> Result<()> {
    let version = session
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", session.selector()))?;
    println!("Connected to {} (protocol {})", session.selector(), version);

    let dispatcher = Dispatcher::new(session.clone());
    // Subscribe first so events racing the response are not missed
    let mut events = dispatcher.events();

    let response = dispatcher
        .request_default(payload)
        .await
        .context("Request failed")?;
    println!("Response: {}", to_hex(&response));

    if !stream_events {
        return Ok(());
    }

    info!("Streaming events, press Ctrl+C to exit");
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(frame) => println!("Event: {}", frame),
                None => {
                    warn!("Event stream ended (session {})", session.state());
                    return Ok(());
                }
            },
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down");
                return Ok(());
            }
        }
    }
}

/// Parse `"01 02 0a"`, `"01020a"` or `"0x01,0x02"` into bytes
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|token| token.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();

    if !digits.is_ascii() {
        bail!("non-hex characters in '{}'", input);
    }
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits in '{}'", input);
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("'{}' is not a hex byte", &digits[i..i + 2]))
        })
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
