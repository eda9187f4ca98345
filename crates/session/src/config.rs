//! Runtime settings for one session

use common::HostConfig;
use protocol::FrameCodec;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the Handshaking state
    pub handshake_timeout: Duration,
    /// Default timeout for requests; also how long a finished id is
    /// remembered for duplicate detection
    pub request_timeout: Duration,
    pub write_timeout: Duration,
    /// Timeout of one read in the read loop
    pub read_poll: Duration,
    pub max_read_size: usize,
    /// Read silence after which a buffered partial frame is discarded
    pub partial_frame_timeout: Duration,
    pub event_queue_capacity: usize,
    pub max_consecutive_frame_errors: u32,
    pub sequence_space: u32,
    pub codec: FrameCodec,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&HostConfig::default())
    }
}

impl From<&HostConfig> for SessionConfig {
    fn from(config: &HostConfig) -> Self {
        let s = &config.session;
        Self {
            handshake_timeout: s.handshake_timeout(),
            request_timeout: s.request_timeout(),
            write_timeout: s.write_timeout(),
            read_poll: s.read_poll(),
            max_read_size: s.max_read_size.max(1),
            partial_frame_timeout: s.partial_frame_timeout(),
            event_queue_capacity: s.event_queue_capacity.max(1),
            max_consecutive_frame_errors: s.max_consecutive_frame_errors,
            sequence_space: s.sequence_space,
            codec: config.framing.codec(),
        }
    }
}
