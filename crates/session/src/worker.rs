//! Read loop thread
//!
//! Dedicated thread per connection that polls the IN endpoint with a short
//! timeout, reassembles frames and routes each one by sequence id to its
//! pending request or to the event stream. The short poll lets `close()`
//! stop the loop promptly through the shutdown flag.

use crate::error::{SessionError, TransportError};
use crate::sequence::Routed;
use crate::session::Shared;
use crate::usb::Transport;
use protocol::{Frame, FrameDecoder, ProtocolError, RawPacket, hex_dump};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Spawn the read loop for a freshly opened transport
pub(crate) fn spawn_read_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-read-loop".to_string())
        .spawn(move || ReadLoop::new(shared, transport, shutdown).run())
}

struct ReadLoop {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    shutdown: Arc<AtomicBool>,
    decoder: FrameDecoder,
    consecutive_errors: u32,
    last_data: Instant,
}

impl ReadLoop {
    fn new(shared: Arc<Shared>, transport: Arc<dyn Transport>, shutdown: Arc<AtomicBool>) -> Self {
        let decoder = shared.config.codec.decoder();
        Self {
            shared,
            transport,
            shutdown,
            decoder,
            consecutive_errors: 0,
            last_data: Instant::now(),
        }
    }

    fn run(mut self) {
        info!("Read loop started");
        let poll = self.shared.config.read_poll;
        let max_read = self.shared.config.max_read_size;

        while !self.shutdown.load(Ordering::Acquire) {
            let step = match self.transport.read_bulk(max_read, poll) {
                Ok(packet) if packet.is_empty() => self.expire_partial(),
                Ok(packet) => self.ingest(&packet),
                Err(TransportError::Timeout) => self.expire_partial(),
                Err(e) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    warn!("Read failed: {}", e);
                    Err(self.read_failure(e))
                }
            };

            if let Err(cause) = step {
                self.shared.fault(cause);
                break;
            }
        }

        self.transport.close();
        info!("Read loop stopped");
    }

    /// A failed read on an unplugged device is a disconnect, whatever
    /// error the transfer itself reported
    fn read_failure(&self, err: TransportError) -> SessionError {
        if self.transport.is_disconnected() {
            SessionError::DeviceDisconnected
        } else {
            err.into()
        }
    }

    fn ingest(&mut self, packet: &RawPacket) -> Result<(), SessionError> {
        trace!("RX {} bytes\n{}", packet.len(), hex_dump(&packet.data));
        self.last_data = packet.timestamp;
        self.decoder.extend(&packet.data);

        for result in self.decoder.decode_all() {
            match result {
                Ok(frame) => {
                    self.consecutive_errors = 0;
                    self.shared.metrics.record_frame_received();
                    self.route(frame);
                }
                Err(e) => self.framing_error(&e)?,
            }
        }

        self.shared
            .metrics
            .record_resync_bytes(self.decoder.take_skipped());
        Ok(())
    }

    fn route(&self, frame: Frame) {
        match self.shared.table.route(frame) {
            Routed::Completed { seq, elapsed } => {
                trace!("Response for seq={} after {:?}", seq, elapsed);
            }
            Routed::Duplicate { seq, outcome } => {
                self.shared.metrics.record_duplicate();
                warn!(
                    "Dropping duplicate response for seq={} (request {})",
                    seq, outcome
                );
            }
            Routed::Unmatched(frame) => self.shared.publish_event(frame),
        }
    }

    /// Count a framing anomaly; too many in a row fault the session
    fn framing_error(&mut self, err: &ProtocolError) -> Result<(), SessionError> {
        match err {
            ProtocolError::ChecksumMismatch { .. } => {
                self.shared.metrics.record_checksum_failure()
            }
            _ => self.shared.metrics.record_malformed_frame(),
        }
        warn!("{}; resynchronising", err);

        self.consecutive_errors += 1;
        let limit = self.shared.config.max_consecutive_frame_errors;
        if limit > 0 && self.consecutive_errors > limit {
            return Err(SessionError::TransportIo(format!(
                "{} consecutive framing errors",
                self.consecutive_errors
            )));
        }
        Ok(())
    }

    /// Drop a partial frame that has seen no new bytes for too long
    fn expire_partial(&mut self) -> Result<(), SessionError> {
        if self.decoder.buffered() == 0 {
            return Ok(());
        }
        let silence = self.last_data.elapsed();
        if silence < self.shared.config.partial_frame_timeout {
            return Ok(());
        }

        let dropped = self.decoder.reset();
        debug!(
            "Discarding {} bytes of incomplete frame after {:?} of silence",
            dropped, silence
        );
        self.shared
            .metrics
            .record_resync_bytes(self.decoder.take_skipped());
        self.framing_error(&ProtocolError::MalformedFrame(
            protocol::Malformation::Incomplete { buffered: dropped },
        ))
    }
}
