//! Session layer for G2-style USB devices
//!
//! Builds a request/response protocol on top of a bulk endpoint pair:
//! - [`usb`]: blocking transport over rusb, plus the [`Transport`] and
//!   [`Connector`] traits
//! - [`Session`]: connect/handshake, sequence ids, response correlation,
//!   fault handling and a dedicated read thread
//! - [`Dispatcher`]: one-shot requests and the inbound event stream
//!
//! # Example
//!
//! ```no_run
//! use common::HostConfig;
//! use session::{Dispatcher, Session, SessionConfig, usb::RusbConnector};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let host = HostConfig::default();
//! let connector = RusbConnector::new(host.device.endpoints())?;
//! let session = Arc::new(Session::new(
//!     Arc::new(connector),
//!     host.device.device_selector()?,
//!     SessionConfig::from(&host),
//! ));
//!
//! session.connect().await?;
//! let dispatcher = Dispatcher::new(session.clone());
//! let reply = dispatcher.request_default(vec![0x01, 0x02]).await?;
//! println!("reply: {:02x?}", reply);
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod sequence;
pub mod session;
pub mod stats;
pub mod test_utils;
pub mod usb;
mod worker;

pub use config::SessionConfig;
pub use dispatcher::{Dispatcher, EventStream};
pub use error::{Result, SessionError, TransportError};
pub use sequence::{Completion, MAX_SEQUENCE_SPACE};
pub use session::{ResponseHandle, Session, SessionState};
pub use stats::SessionStats;
pub use usb::{Connector, Transport};
