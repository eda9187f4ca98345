//! Session state machine
//!
//! ```text
//! Disconnected -> Handshaking -> Ready -> Closing -> Disconnected
//!                      |           |
//!                      +-> Faulted <+
//! ```
//!
//! `connect()` opens the transport, starts the read loop and exchanges
//! protocol versions. Requests are only accepted in `Ready`. A fatal
//! transport error moves the session to `Faulted`, fails every pending
//! request and releases the device; a new `connect()` starts over.

use crate::config::SessionConfig;
use crate::dispatcher::EventStream;
use crate::error::{Result, SessionError, TransportError};
use crate::sequence::{Completion, PendingTable, Reply};
use crate::stats::{SessionMetrics, SessionStats};
use crate::usb::{Connector, Transport};
use crate::worker;
use common::DeviceSelector;
use protocol::{
    CURRENT_VERSION, Frame, ProtocolVersion, SequenceId, hex_dump, opcode, validate_version,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Connection state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Ready,
    Closing,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// State shared between the session handle, response handles and the read
/// loop
pub(crate) struct Shared {
    pub config: SessionConfig,
    pub table: PendingTable,
    pub metrics: SessionMetrics,
    state: watch::Sender<SessionState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Dropped on close or fault so every event stream ends
    events: Mutex<Option<broadcast::Sender<Frame>>>,
}

impl Shared {
    fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            table: PendingTable::new(config.sequence_space, config.request_timeout),
            metrics: SessionMetrics::default(),
            state,
            transport: RwLock::new(None),
            events: Mutex::new(None),
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("Session state: {} -> {}", prev, next);
        }
    }

    /// Move `from -> to` only if the session is still in `from`
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Session state: {} -> {}", from, to);
        }
        changed
    }

    /// Fault the session after an unrecoverable error.
    ///
    /// Only the first fault of a connection takes effect; returns false when
    /// the session was not live.
    pub fn fault(&self, cause: SessionError) -> bool {
        let faulted = self.state.send_if_modified(|state| match state {
            SessionState::Handshaking | SessionState::Ready => {
                *state = SessionState::Faulted;
                true
            }
            _ => false,
        });
        if !faulted {
            debug!("Ignoring fault while not connected: {}", cause);
            return false;
        }

        error!("Session faulted: {}", cause);
        let failed = self
            .table
            .fail_all(SessionError::SessionFaulted(cause.to_string()));
        if failed > 0 {
            warn!("Failed {} pending requests", failed);
        }
        self.release_link();
        true
    }

    fn attach(&self, transport: Arc<dyn Transport>, events: broadcast::Sender<Frame>) {
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = Some(transport);
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(events);
    }

    /// Drop the event sender and close the transport
    fn release_link(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take();
        let transport = self
            .transport
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(transport) = transport {
            transport.close();
        }
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn publish_event(&self, frame: Frame) {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = events.as_ref() else {
            return;
        };
        debug!("Inbound event {}", frame);
        if let Err(broadcast::error::SendError(frame)) = tx.send(frame) {
            debug!("No event subscribers, dropping {}", frame);
        }
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Frame>> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|tx| tx.subscribe())
    }
}

/// Read loop belonging to one connection
struct Link {
    shutdown: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Signal the read loop and wait for it to exit
    async fn stop(self) {
        self.shutdown.store(true, Ordering::Release);
        let reader = self.reader;
        match tokio::task::spawn_blocking(move || reader.join()).await {
            Ok(Ok(())) => debug!("Read loop joined"),
            Ok(Err(_)) => error!("Read loop panicked"),
            Err(e) => error!("Failed to join read loop: {}", e),
        }
    }
}

/// One logical connection to a device
pub struct Session {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    selector: DeviceSelector,
    /// Serialises connect/close and owns the current read loop
    lifecycle: tokio::sync::Mutex<Option<Link>>,
}

impl Session {
    pub fn new(
        connector: Arc<dyn Connector>,
        selector: DeviceSelector,
        config: SessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            connector,
            selector,
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.metrics.snapshot()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.table.pending_count()
    }

    pub fn is_pending(&self, seq: SequenceId) -> bool {
        self.shared.table.is_pending(seq)
    }

    /// Open the device and perform the version handshake.
    ///
    /// Allowed from `Disconnected` and `Faulted`. On handshake failure the
    /// device is released and the session is left `Faulted`.
    pub async fn connect(&self) -> Result<ProtocolVersion> {
        let mut link = self.lifecycle.lock().await;
        if matches!(
            self.state(),
            SessionState::Ready | SessionState::Handshaking
        ) {
            return Err(SessionError::AlreadyConnected);
        }

        // Reap the read loop of a faulted connection
        if let Some(old) = link.take() {
            old.stop().await;
        }

        self.shared.set_state(SessionState::Handshaking);
        info!("Connecting to {}", self.selector);

        let connector = self.connector.clone();
        let selector = self.selector.clone();
        let opened = tokio::task::spawn_blocking(move || connector.open(&selector))
            .await
            .unwrap_or_else(|e| Err(TransportError::Io(format!("open task failed: {}", e))));

        let transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to open {}: {}", self.selector, e);
                self.shared.set_state(SessionState::Disconnected);
                return Err(match e {
                    TransportError::NotFound => {
                        SessionError::DeviceNotFound(self.selector.to_string())
                    }
                    other => other.into(),
                });
            }
        };

        self.shared.table.open();
        let (events, _) = broadcast::channel(self.shared.config.event_queue_capacity);
        self.shared.attach(transport.clone(), events);

        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = match worker::spawn_read_loop(self.shared.clone(), transport, shutdown.clone())
        {
            Ok(reader) => reader,
            Err(e) => {
                let cause = SessionError::TransportIo(format!("failed to spawn read loop: {}", e));
                self.shared.fault(cause.clone());
                return Err(cause);
            }
        };
        *link = Some(Link { shutdown, reader });

        let outcome = match self.handshake().await {
            Ok(version) => {
                if self
                    .shared
                    .transition(SessionState::Handshaking, SessionState::Ready)
                {
                    Ok(version)
                } else {
                    Err(SessionError::HandshakeFailed(
                        "session faulted during handshake".into(),
                    ))
                }
            }
            Err(e) => Err(match e {
                SessionError::HandshakeFailed(_) => e,
                other => SessionError::HandshakeFailed(other.to_string()),
            }),
        };

        match outcome {
            Ok(version) => {
                info!("Session ready with {} (device protocol {})", self.selector, version);
                Ok(version)
            }
            Err(e) => {
                self.shared.fault(e.clone());
                if let Some(old) = link.take() {
                    old.stop().await;
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<ProtocolVersion> {
        let timeout = self.shared.config.handshake_timeout;
        let handle = self
            .send_frame(opcode::HANDSHAKE, CURRENT_VERSION.to_bytes().to_vec())
            .await?;
        debug!("Handshake sent with seq={}, protocol {}", handle.seq(), CURRENT_VERSION);

        let ack = handle.wait(timeout).await.map_err(|e| match e {
            SessionError::RequestTimeout { .. } => {
                SessionError::HandshakeFailed(format!("no acknowledgement within {:?}", timeout))
            }
            other => other,
        })?;

        if !ack.is_handshake_ack() {
            return Err(SessionError::HandshakeFailed(format!(
                "unexpected opcode {:#04x} in handshake reply",
                ack.opcode
            )));
        }
        let version = ProtocolVersion::from_bytes(&ack.payload)?;
        validate_version(&version)?;
        Ok(version)
    }

    /// Send a frame with a freshly assigned sequence id.
    ///
    /// The returned handle resolves to the frame the device answers with.
    pub async fn send(&self, opcode: u8, payload: Vec<u8>) -> Result<ResponseHandle> {
        match self.state() {
            // A faulted session rejects through the table with the fault cause
            SessionState::Ready | SessionState::Faulted => {}
            _ => return Err(SessionError::SessionClosed),
        }
        self.send_frame(opcode, payload).await
    }

    async fn send_frame(&self, opcode: u8, payload: Vec<u8>) -> Result<ResponseHandle> {
        let (seq, rx) = self.shared.table.register(opcode)?;
        let handle = ResponseHandle {
            seq,
            rx,
            shared: self.shared.clone(),
            finished: false,
        };

        let frame = Frame::new(seq, opcode, payload);
        let bytes = self.shared.config.codec.encode(&frame)?;
        let transport = self.shared.transport().ok_or(SessionError::SessionClosed)?;
        trace!("TX {}\n{}", frame, hex_dump(&bytes));

        let shared = self.shared.clone();
        let timeout = self.shared.config.write_timeout;
        tokio::task::spawn_blocking(move || {
            let result = transport.write_bulk(&bytes, timeout);
            if let Err(e) = &result {
                if e.is_fatal() {
                    shared.fault(e.clone().into());
                }
            }
            result
        })
        .await
        .map_err(|e| SessionError::TransportIo(format!("write task failed: {}", e)))??;

        self.shared.metrics.record_frame_sent();
        debug!("Sent {}", frame);
        Ok(handle)
    }

    /// Cancel a pending request by id, releasing its waiter with
    /// `Cancelled`. Returns false if the id was not pending.
    pub fn cancel(&self, seq: SequenceId) -> bool {
        let cancelled = self.shared.table.finish(seq, Completion::Cancelled);
        if cancelled {
            debug!("Cancelled request seq={}", seq);
        }
        cancelled
    }

    /// Subscribe to unsolicited frames from this point on
    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.shared.subscribe(), self.shared.clone())
    }

    /// Close the session.
    ///
    /// Pending requests fail with `SessionClosed`, the read loop is stopped
    /// and the device released. Closing a closed session is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut link = self.lifecycle.lock().await;
        let prev = self.state();
        if prev == SessionState::Disconnected {
            return Ok(());
        }

        self.shared.set_state(SessionState::Closing);
        let failed = self.shared.table.fail_all(SessionError::SessionClosed);
        if failed > 0 {
            info!("Closing with {} pending requests", failed);
        }

        let shared = self.shared.clone();
        let current = link.take();
        if let Some(current) = &current {
            current.shutdown.store(true, Ordering::Release);
        }
        if let Err(e) = tokio::task::spawn_blocking(move || shared.release_link()).await {
            error!("Failed to release device: {}", e);
        }
        if let Some(current) = current {
            current.stop().await;
        }

        self.shared.set_state(SessionState::Disconnected);
        info!("Session with {} closed", self.selector);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The read loop closes the transport on its way out
        if let Some(link) = self.lifecycle.get_mut().take() {
            link.shutdown.store(true, Ordering::Release);
        }
        self.shared.table.fail_all(SessionError::SessionClosed);
        self.shared.events.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Pending response for one sent frame.
///
/// Dropping the handle without awaiting it cancels the request.
pub struct ResponseHandle {
    seq: SequenceId,
    rx: oneshot::Receiver<Reply>,
    shared: Arc<Shared>,
    finished: bool,
}

impl ResponseHandle {
    pub fn seq(&self) -> SequenceId {
        self.seq
    }

    /// Wait for the response, failing with `RequestTimeout` after `timeout`.
    /// The session stays usable after a timeout.
    pub async fn wait(mut self, timeout: Duration) -> Result<Frame> {
        let outcome = tokio::time::timeout(timeout, &mut self.rx).await;
        self.finished = true;

        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SessionError::SessionClosed),
            Err(_) => {
                if self.shared.table.finish(self.seq, Completion::TimedOut) {
                    self.shared.metrics.record_request_timeout();
                    warn!("Request seq={} timed out after {:?}", self.seq, timeout);
                    return Err(SessionError::RequestTimeout {
                        seq: self.seq,
                        timeout,
                    });
                }
                // Resolved between the timer firing and the removal
                self.rx.try_recv().unwrap_or(Err(SessionError::RequestTimeout {
                    seq: self.seq,
                    timeout,
                }))
            }
        }
    }

    /// Give up on the response. A response arriving later is dropped as a
    /// duplicate.
    pub fn cancel(mut self) -> bool {
        self.finished = true;
        self.shared.table.finish(self.seq, Completion::Cancelled)
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.table.finish(self.seq, Completion::Cancelled);
        }
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("seq", &self.seq)
            .field("finished", &self.finished)
            .finish()
    }
}
