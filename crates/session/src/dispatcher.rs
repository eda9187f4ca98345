//! Caller-facing request/response and event API
//!
//! [`Dispatcher`] performs exactly one round trip per call; retrying is left
//! to the caller, who can tell timeouts apart from faults through
//! [`SessionError::is_retryable`](crate::SessionError::is_retryable).

use crate::error::Result;
use crate::session::{Session, Shared};
use protocol::{Frame, opcode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

/// Request/response facade over a [`Session`]
#[derive(Clone)]
pub struct Dispatcher {
    session: Arc<Session>,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Send `payload` with the generic request opcode and return the
    /// response payload
    pub async fn request(&self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let frame = self
            .request_with_opcode(opcode::REQUEST, payload, timeout)
            .await?;
        Ok(frame.payload)
    }

    /// [`request`](Self::request) with the configured default timeout
    pub async fn request_default(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let timeout = self.session.config().request_timeout;
        self.request(payload, timeout).await
    }

    /// Send a frame with any opcode and return the whole response frame
    pub async fn request_with_opcode(
        &self,
        opcode: u8,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Frame> {
        let handle = self.session.send(opcode, payload).await?;
        handle.wait(timeout).await
    }

    /// Unsolicited frames from now until the session closes or faults.
    ///
    /// Each stream sees only events published after it was created.
    pub fn events(&self) -> EventStream {
        self.session.subscribe_events()
    }
}

/// Bounded stream of inbound events.
///
/// A subscriber that falls behind by more than the queue capacity loses the
/// oldest events; the loss is counted in the session stats.
pub struct EventStream {
    rx: Option<broadcast::Receiver<Frame>>,
    shared: Arc<Shared>,
}

impl EventStream {
    pub(crate) fn new(rx: Option<broadcast::Receiver<Frame>>, shared: Arc<Shared>) -> Self {
        Self { rx, shared }
    }

    /// Next event, or `None` once the session has closed or faulted
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(frame) => {
                    self.shared.metrics.record_event_delivered();
                    return Some(frame);
                }
                Err(RecvError::Lagged(missed)) => {
                    self.shared.metrics.record_events_dropped(missed);
                    warn!("Event subscriber lagged, {} events dropped", missed);
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// True once the stream has ended
    pub fn is_terminated(&self) -> bool {
        self.rx.is_none()
    }
}
