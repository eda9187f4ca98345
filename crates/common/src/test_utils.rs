//! Test utilities for the g2-usb crates
//!
//! Provides a transfer-shaped byte helper and an async timeout wrapper shared
//! by the test suites of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::split_into_transfers;
//!
//! let transfers = split_into_transfers(&[0u8; 130], 64);
//! assert_eq!(transfers.len(), 3);
//! ```

use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Split a byte stream the way a device with `max_packet` sized IN
/// transfers would deliver it
pub fn split_into_transfers(bytes: &[u8], max_packet: usize) -> Vec<Vec<u8>> {
    bytes
        .chunks(max_packet.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
