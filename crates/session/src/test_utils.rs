//! Scripted in-memory device for exercising sessions without hardware
//!
//! [`MockDevice`] implements [`Transport`]: frames written by the host are
//! decoded and handed to a responder closure whose replies are queued for the
//! read loop. Handshakes are acknowledged automatically unless disabled.
//!
//! With [`MockDevice::set_announced`] the device delivers each message the
//! way an interrupt-announcing device does: short messages inline in an
//! interrupt header, longer ones as a size header plus a bulk body.
//!
//! # Example
//!
//! ```
//! use protocol::Frame;
//! use session::test_utils::create_mock_session;
//! use session::SessionConfig;
//!
//! let (session, device) = create_mock_session(SessionConfig::default());
//! device.set_responder(|frame| vec![Frame::new(frame.seq, frame.opcode, vec![0xAA])]);
//! # drop(session);
//! ```

use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::session::Session;
use crate::usb::{Announcement, Connector, Transport, parse_announcement, read_extended};
use common::DeviceSelector;
use protocol::{
    CURRENT_VERSION, Frame, FrameCodec, FrameDecoder, ProtocolVersion, RawPacket, opcode,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Produces the device's replies to one host frame
pub type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

/// Longest message an embedded announcement can carry
const EMBEDDED_MAX: usize = 15;

struct MockState {
    /// Raw transfers, or announcement headers in announced mode
    inbound: VecDeque<Vec<u8>>,
    /// Extended message bodies awaiting bulk reads
    bulk: VecDeque<Vec<u8>>,
    announced: Option<u8>,
    bulk_misses: usize,
    read_error: Option<TransportError>,
    written: Vec<RawPacket>,
    frames: Vec<Frame>,
    decoder: FrameDecoder,
    responder: Option<Responder>,
    handshake: Option<ProtocolVersion>,
    open: bool,
    disconnected: bool,
}

/// In-memory device speaking the frame protocol
pub struct MockDevice {
    codec: FrameCodec,
    state: Mutex<MockState>,
    readable: Condvar,
}

impl MockDevice {
    /// Device that acknowledges handshakes with the current protocol version
    /// and ignores every other frame until a responder is set
    pub fn new(codec: FrameCodec) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                inbound: VecDeque::new(),
                bulk: VecDeque::new(),
                announced: None,
                bulk_misses: 0,
                read_error: None,
                written: Vec::new(),
                frames: Vec::new(),
                decoder: codec.decoder(),
                responder: None,
                handshake: Some(CURRENT_VERSION),
                open: false,
                disconnected: false,
            }),
            codec,
            readable: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Version to acknowledge handshakes with; `None` passes handshake
    /// frames to the responder instead
    pub fn set_handshake(&self, version: Option<ProtocolVersion>) {
        self.lock().handshake = version;
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Announce messages on the interrupt endpoint, allowing `retries` empty
    /// bulk reads per extended message; `None` delivers raw transfers
    pub fn set_announced(&self, retries: Option<u8>) {
        self.lock().announced = retries;
    }

    /// Make the next `count` bulk reads of extended bodies come back empty
    pub fn miss_bulk_reads(&self, count: usize) {
        self.lock().bulk_misses = count;
    }

    /// Queue an interrupt header as is, bypassing announcement encoding
    pub fn push_announcement(&self, header: Vec<u8>) {
        self.lock().inbound.push_back(header);
        self.readable.notify_all();
    }

    /// Queue an unsolicited frame for the host
    pub fn push_frame(&self, frame: &Frame) {
        if let Ok(bytes) = self.codec.encode(frame) {
            self.push_raw(bytes);
        }
    }

    /// Queue raw bytes as one IN transfer, or one announced message
    pub fn push_raw(&self, bytes: Vec<u8>) {
        Self::enqueue(&mut self.lock(), bytes);
        self.readable.notify_all();
    }

    /// Simulate the device being unplugged
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
        self.readable.notify_all();
    }

    /// Unplug the device, with reads failing with `err` instead of a
    /// disconnect error
    pub fn unplug_with(&self, err: TransportError) {
        let mut state = self.lock();
        state.disconnected = true;
        state.read_error = Some(err);
        drop(state);
        self.readable.notify_all();
    }

    fn enqueue(state: &mut MockState, bytes: Vec<u8>) {
        if state.announced.is_none() {
            state.inbound.push_back(bytes);
        } else if bytes.len() <= EMBEDDED_MAX {
            let mut header = vec![((bytes.len() as u8) << 4) | 0x02];
            header.extend(bytes);
            state.inbound.push_back(header);
        } else {
            let size = (bytes.len() as u16).to_be_bytes();
            state.inbound.push_back(vec![0x01, size[0], size[1]]);
            state.bulk.push_back(bytes);
        }
    }

    /// Serve one bulk read of an extended body
    fn read_body(state: &mut MockState, buffer: &mut [u8]) -> Result<usize, TransportError> {
        if state.bulk_misses > 0 {
            state.bulk_misses -= 1;
            return Ok(0);
        }
        let Some(mut body) = state.bulk.pop_front() else {
            return Err(TransportError::Timeout);
        };
        let n = body.len().min(buffer.len());
        buffer[..n].copy_from_slice(&body[..n]);
        if n < body.len() {
            state.bulk.push_front(body.split_off(n));
        }
        Ok(n)
    }

    /// Every frame the host has written, in order
    pub fn written_frames(&self) -> Vec<Frame> {
        self.lock().frames.clone()
    }

    /// Number of OUT transfers received
    pub fn write_count(&self) -> usize {
        self.lock().written.len()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    fn attach(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::NotFound);
        }
        if state.open {
            return Err(TransportError::Busy);
        }
        state.open = true;
        state.decoder.reset();
        Ok(())
    }

    fn encode_replies(&self, replies: Vec<Frame>, state: &mut MockState) {
        for reply in replies {
            if let Ok(bytes) = self.codec.encode(&reply) {
                Self::enqueue(state, bytes);
            }
        }
    }
}

impl Transport for MockDevice {
    fn write_bulk(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if !state.open {
            return Err(TransportError::Closed);
        }

        state.written.push(RawPacket::outbound(data.to_vec()));
        state.decoder.extend(data);
        let frames: Vec<Frame> = state
            .decoder
            .decode_all()
            .into_iter()
            .filter_map(|r| r.ok())
            .collect();

        for frame in frames {
            state.frames.push(frame.clone());
            let replies = match (frame.opcode, state.handshake) {
                (opcode::HANDSHAKE, Some(version)) => vec![Frame::new(
                    frame.seq,
                    opcode::HANDSHAKE_ACK,
                    version.to_bytes().to_vec(),
                )],
                _ => match state.responder.as_mut() {
                    Some(responder) => responder(&frame),
                    None => Vec::new(),
                },
            };
            self.encode_replies(replies, &mut state);
        }

        self.readable.notify_all();
        Ok(data.len())
    }

    fn read_bulk(&self, max_len: usize, timeout: Duration) -> Result<RawPacket, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if let Some(err) = state.read_error.clone() {
                return Err(err);
            }
            if state.disconnected {
                return Err(TransportError::Disconnected);
            }
            if !state.open {
                return Err(TransportError::Closed);
            }
            if let Some(retries) = state.announced {
                if let Some(header) = state.inbound.pop_front() {
                    let data = match parse_announcement(&header) {
                        Announcement::Embedded(message) => message,
                        Announcement::Extended(size) => {
                            read_extended(size, retries, |buffer| {
                                Self::read_body(&mut state, buffer)
                            })?
                        }
                        Announcement::Ignored => Vec::new(),
                    };
                    return Ok(RawPacket::inbound(data));
                }
            } else if let Some(mut chunk) = state.inbound.pop_front() {
                if chunk.len() > max_len {
                    let rest = chunk.split_off(max_len);
                    state.inbound.push_front(rest);
                }
                return Ok(RawPacket::inbound(chunk));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            state = self
                .readable
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn close(&self) {
        self.lock().open = false;
        self.readable.notify_all();
    }

    fn is_disconnected(&self) -> bool {
        self.lock().disconnected
    }
}

/// Connector handing out one [`MockDevice`]
pub struct MockConnector {
    device: Arc<MockDevice>,
    failure: Mutex<Option<TransportError>>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new(device: Arc<MockDevice>) -> Self {
        Self {
            device,
            failure: Mutex::new(None),
            opens: AtomicUsize::new(0),
        }
    }

    /// Make subsequent opens fail with `err`
    pub fn fail_with(&self, err: Option<TransportError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = err;
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

impl Connector for MockConnector {
    fn open(&self, _selector: &DeviceSelector) -> Result<Arc<dyn Transport>, TransportError> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }
        self.device.attach()?;
        Ok(self.device.clone())
    }
}

/// Session wired to a fresh mock device using the session's codec
pub fn create_mock_session(config: SessionConfig) -> (Arc<Session>, Arc<MockDevice>) {
    let (session, device, _) = create_mock_session_with_connector(config);
    (session, device)
}

/// Like [`create_mock_session`], also returning the connector to script
/// open failures
pub fn create_mock_session_with_connector(
    config: SessionConfig,
) -> (Arc<Session>, Arc<MockDevice>, Arc<MockConnector>) {
    let device = MockDevice::new(config.codec.clone());
    let connector = Arc::new(MockConnector::new(device.clone()));
    let session = Arc::new(Session::new(
        connector.clone(),
        DeviceSelector::default(),
        config,
    ));
    (session, device, connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened_device() -> Arc<MockDevice> {
        let device = MockDevice::new(FrameCodec::default());
        let connector = MockConnector::new(device.clone());
        connector.open(&DeviceSelector::default()).unwrap();
        device
    }

    #[test]
    fn test_handshake_acknowledged() {
        let device = opened_device();
        let codec = FrameCodec::default();
        let hello = codec
            .encode(&Frame::new(0, opcode::HANDSHAKE, vec![1, 0]))
            .unwrap();
        device.write_bulk(&hello, Duration::from_millis(10)).unwrap();

        let packet = device.read_bulk(512, Duration::from_millis(10)).unwrap();
        let mut decoder = codec.decoder();
        decoder.extend(&packet.data);
        let ack = decoder.decode_all().remove(0).unwrap();
        assert_eq!(ack, Frame::new(0, opcode::HANDSHAKE_ACK, vec![1, 0]));
    }

    #[test]
    fn test_read_splits_to_max_len() {
        let device = opened_device();
        device.push_raw(vec![1, 2, 3, 4, 5]);

        let first = device.read_bulk(2, Duration::from_millis(10)).unwrap();
        let second = device.read_bulk(16, Duration::from_millis(10)).unwrap();
        assert_eq!(first.data, vec![1, 2]);
        assert_eq!(second.data, vec![3, 4, 5]);
        assert_eq!(
            device.read_bulk(16, Duration::from_millis(5)).unwrap_err(),
            TransportError::Timeout
        );
    }

    #[test]
    fn test_exclusive_open_and_close() {
        let device = MockDevice::new(FrameCodec::default());
        let connector = MockConnector::new(device.clone());

        assert!(connector.open(&DeviceSelector::default()).is_ok());
        assert!(matches!(
            connector.open(&DeviceSelector::default()),
            Err(TransportError::Busy)
        ));

        device.close();
        device.close();
        assert!(!device.is_open());
        assert!(connector.open(&DeviceSelector::default()).is_ok());
        assert_eq!(connector.open_count(), 3);
    }

    #[test]
    fn test_disconnect() {
        let device = opened_device();
        device.disconnect();
        assert!(device.is_disconnected());
        assert_eq!(
            device.read_bulk(16, Duration::from_millis(5)).unwrap_err(),
            TransportError::Disconnected
        );
    }

    #[test]
    fn test_announced_embedded_and_extended() {
        let device = opened_device();
        device.set_announced(Some(3));
        device.push_raw(vec![7; 15]);
        device.push_raw((0..40).collect());

        let short = device.read_bulk(512, Duration::from_millis(10)).unwrap();
        let long = device.read_bulk(512, Duration::from_millis(10)).unwrap();
        assert_eq!(short.data, vec![7; 15]);
        assert_eq!(long.data, (0..40).collect::<Vec<u8>>());
    }

    #[test]
    fn test_announced_body_survives_missed_reads() {
        let device = opened_device();
        device.set_announced(Some(3));
        device.miss_bulk_reads(2);
        device.push_raw(vec![1; 20]);

        let packet = device.read_bulk(512, Duration::from_millis(10)).unwrap();
        assert_eq!(packet.data, vec![1; 20]);
    }

    #[test]
    fn test_announced_body_lost_after_retries() {
        let device = opened_device();
        device.set_announced(Some(2));
        device.miss_bulk_reads(2);
        device.push_raw(vec![1; 20]);

        assert_eq!(
            device.read_bulk(512, Duration::from_millis(10)).unwrap_err(),
            TransportError::Timeout
        );
    }

    #[test]
    fn test_unknown_announcement_reads_empty() {
        let device = opened_device();
        device.set_announced(Some(1));
        device.push_announcement(vec![0x05, 0xAA]);

        let packet = device.read_bulk(512, Duration::from_millis(10)).unwrap();
        assert!(packet.is_empty());
    }

    #[test]
    fn test_unplug_with_error() {
        let device = opened_device();
        device.unplug_with(TransportError::Io("pipe".into()));
        assert!(device.is_disconnected());
        assert_eq!(
            device.read_bulk(16, Duration::from_millis(5)).unwrap_err(),
            TransportError::Io("pipe".into())
        );
    }
}
