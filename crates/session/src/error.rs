//! Transport and session error types

use protocol::{ProtocolError, SequenceId};
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`Transport`](crate::usb::Transport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("No device matches the selector")]
    NotFound,

    #[error("Device or interface is busy")]
    Busy,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Transfer timed out")]
    Timeout,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Transport is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Errors after which the device handle is unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected | TransportError::Io(_) | TransportError::Closed
        )
    }
}

/// Errors surfaced to session callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device is busy")]
    DeviceBusy,

    #[error("Device disconnected")]
    DeviceDisconnected,

    #[error("USB transfer timed out")]
    TransportTimeout,

    #[error("USB transport error: {0}")]
    TransportIo(String),

    #[error("Permission denied opening device")]
    PermissionDenied,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Request {seq} timed out after {timeout:?}")]
    RequestTimeout { seq: SequenceId, timeout: Duration },

    #[error("Session closed")]
    SessionClosed,

    #[error("Session faulted: {0}")]
    SessionFaulted(String),

    #[error("No free sequence id: {pending} requests outstanding")]
    SequenceSpaceExhausted { pending: usize },

    #[error("Request {0} cancelled")]
    Cancelled(SequenceId),

    #[error("Session is already connected")]
    AlreadyConnected,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Retrying the same call may succeed without reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::TransportTimeout
                | SessionError::RequestTimeout { .. }
                | SessionError::SequenceSpaceExhausted { .. }
                | SessionError::DeviceBusy
        )
    }

    /// The session must be reconnected before further requests can succeed
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            SessionError::DeviceDisconnected
                | SessionError::TransportIo(_)
                | SessionError::SessionFaulted(_)
                | SessionError::HandshakeFailed(_)
        )
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound => SessionError::DeviceNotFound("no matching device".into()),
            TransportError::Busy => SessionError::DeviceBusy,
            TransportError::Disconnected => SessionError::DeviceDisconnected,
            TransportError::Timeout => SessionError::TransportTimeout,
            TransportError::PermissionDenied => SessionError::PermissionDenied,
            TransportError::Closed => SessionError::SessionClosed,
            TransportError::Io(msg) => SessionError::TransportIo(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(
            SessionError::from(TransportError::Timeout),
            SessionError::TransportTimeout
        );
        assert_eq!(
            SessionError::from(TransportError::Disconnected),
            SessionError::DeviceDisconnected
        );
        assert_eq!(
            SessionError::from(TransportError::Io("pipe".into())),
            SessionError::TransportIo("pipe".into())
        );
    }

    #[test]
    fn test_classification() {
        let timeout = SessionError::RequestTimeout {
            seq: 3,
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.requires_reconnect());

        let faulted = SessionError::SessionFaulted("device disconnected".into());
        assert!(!faulted.is_retryable());
        assert!(faulted.requires_reconnect());

        // Caller errors are neither
        assert!(!SessionError::SessionClosed.is_retryable());
        assert!(!SessionError::SessionClosed.requires_reconnect());
        assert!(!SessionError::AlreadyConnected.requires_reconnect());
    }

    #[test]
    fn test_fatal_transport_errors() {
        assert!(TransportError::Disconnected.is_fatal());
        assert!(TransportError::Io("overflow".into()).is_fatal());
        assert!(!TransportError::Timeout.is_fatal());
        assert!(!TransportError::Busy.is_fatal());
    }
}
