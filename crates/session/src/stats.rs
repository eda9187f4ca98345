//! Per-session counters
//!
//! Updated lock-free from the read thread and request callers; read through
//! [`SessionStats`] snapshots.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct SessionMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    checksum_failures: AtomicU64,
    malformed_frames: AtomicU64,
    resync_bytes: AtomicU64,
    duplicate_responses: AtomicU64,
    request_timeouts: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
}

impl SessionMetrics {
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync_bytes(&self, bytes: u64) {
        if bytes > 0 {
            self.resync_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_duplicate(&self) {
        self.duplicate_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            resync_bytes: self.resync_bytes.load(Ordering::Relaxed),
            duplicate_responses: self.duplicate_responses.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub checksum_failures: u64,
    pub malformed_frames: u64,
    /// Bytes discarded while searching for a start marker
    pub resync_bytes: u64,
    pub duplicate_responses: u64,
    pub request_timeouts: u64,
    pub events_delivered: u64,
    /// Events a subscriber missed because its queue overflowed
    pub events_dropped: u64,
}

impl SessionStats {
    /// Framing anomalies recovered by resynchronising
    pub fn framing_errors(&self) -> u64 {
        self.checksum_failures + self.malformed_frames
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} received={} checksum_failures={} malformed={} resync_bytes={} \
             duplicates={} timeouts={} events={} events_dropped={}",
            self.frames_sent,
            self.frames_received,
            self.checksum_failures,
            self.malformed_frames,
            self.resync_bytes,
            self.duplicate_responses,
            self.request_timeouts,
            self.events_delivered,
            self.events_dropped
        )
    }
}
