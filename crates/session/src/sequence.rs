//! Sequence id allocation and pending request bookkeeping
//!
//! One table per session, indexed by sequence id. Callers insert under the
//! lock when sending; the read loop removes entries when routing responses.
//! The lock is only held for the map update, never across I/O.

use crate::error::SessionError;
use protocol::{Frame, SequenceId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

pub(crate) type Reply = Result<Frame, SessionError>;

/// Largest usable sequence space: every value of a 16-bit id
pub const MAX_SEQUENCE_SPACE: u32 = 1 << 16;

/// How a request left the pending table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    TimedOut,
    Cancelled,
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Completion::Completed => "completed",
            Completion::TimedOut => "timed out",
            Completion::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

struct PendingRequest {
    opcode: u8,
    submitted: Instant,
    reply: oneshot::Sender<Reply>,
}

/// Outcome of routing an inbound frame
#[derive(Debug)]
pub(crate) enum Routed {
    /// Delivered to the waiting caller
    Completed { seq: SequenceId, elapsed: Duration },
    /// Late or repeated response for an id that already left the table
    Duplicate { seq: SequenceId, outcome: Completion },
    /// No request owns this id
    Unmatched(Frame),
}

struct TableInner {
    next: u32,
    pending: HashMap<SequenceId, PendingRequest>,
    retired: HashMap<SequenceId, (Instant, Completion)>,
    /// Set when the session stops accepting requests
    closed: Option<SessionError>,
}

pub(crate) struct PendingTable {
    inner: Mutex<TableInner>,
    space: u32,
    duplicate_window: Duration,
}

impl PendingTable {
    /// `space` is clamped to `2..=65536`
    pub fn new(space: u32, duplicate_window: Duration) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next: 0,
                pending: HashMap::new(),
                retired: HashMap::new(),
                closed: Some(SessionError::SessionClosed),
            }),
            space: space.clamp(2, MAX_SEQUENCE_SPACE),
            duplicate_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        // Entries stay consistent even if a holder panicked mid-update
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start accepting requests with a fresh id counter
    pub fn open(&self) {
        let mut inner = self.lock();
        inner.next = 0;
        inner.pending.clear();
        inner.retired.clear();
        inner.closed = None;
    }

    /// Assign the next sequence id and register a waiter for it.
    ///
    /// Fails with `SequenceSpaceExhausted` when the next id in order is still
    /// outstanding; ids are never skipped or reused while pending.
    pub fn register(&self, opcode: u8) -> Result<(SequenceId, oneshot::Receiver<Reply>), SessionError> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }

        let seq = inner.next as SequenceId;
        if inner.pending.contains_key(&seq) {
            return Err(SessionError::SequenceSpaceExhausted {
                pending: inner.pending.len(),
            });
        }

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            seq,
            PendingRequest {
                opcode,
                submitted: Instant::now(),
                reply: tx,
            },
        );
        inner.retired.remove(&seq);
        inner.next = (inner.next + 1) % self.space;

        Ok((seq, rx))
    }

    /// Hand an inbound frame to the request that owns its sequence id
    pub fn route(&self, frame: Frame) -> Routed {
        let seq = frame.seq;
        let request = {
            let mut inner = self.lock();
            self.prune_retired(&mut inner);
            match inner.pending.remove(&seq) {
                Some(request) => {
                    inner.retired.insert(seq, (Instant::now(), Completion::Completed));
                    request
                }
                None => {
                    return match inner.retired.get(&seq) {
                        Some(&(_, outcome)) => Routed::Duplicate { seq, outcome },
                        None => Routed::Unmatched(frame),
                    };
                }
            }
        };

        let elapsed = request.submitted.elapsed();
        debug!(
            "Completing request seq={} opcode={:#04x} -> {} after {:?}",
            seq, request.opcode, frame, elapsed
        );
        // The caller may have given up already; that is not an error here
        let _ = request.reply.send(Ok(frame));
        Routed::Completed { seq, elapsed }
    }

    /// Remove a pending request without a response.
    ///
    /// Returns false when the id was not pending (already completed or
    /// never issued).
    pub fn finish(&self, seq: SequenceId, outcome: Completion) -> bool {
        let request = {
            let mut inner = self.lock();
            let request = inner.pending.remove(&seq);
            if request.is_some() {
                inner.retired.insert(seq, (Instant::now(), outcome));
            }
            request
        };

        match request {
            Some(request) => {
                if outcome == Completion::Cancelled {
                    let _ = request.reply.send(Err(SessionError::Cancelled(seq)));
                }
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `err` and reject new ones with it
    pub fn fail_all(&self, err: SessionError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.lock();
            inner.closed = Some(err.clone());
            inner.pending.drain().map(|(_, request)| request).collect()
        };

        let count = drained.len();
        for request in drained {
            let _ = request.reply.send(Err(err.clone()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, seq: SequenceId) -> bool {
        self.lock().pending.contains_key(&seq)
    }

    fn prune_retired(&self, inner: &mut TableInner) {
        let window = self.duplicate_window;
        inner.retired.retain(|_, (at, _)| at.elapsed() <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use protocol::opcode;
    use std::collections::HashSet;

    fn open_table(space: u32) -> PendingTable {
        let table = PendingTable::new(space, Duration::from_secs(1));
        table.open();
        table
    }

    #[test]
    fn test_rejects_before_open() {
        let table = PendingTable::new(16, Duration::from_secs(1));
        assert!(matches!(
            table.register(opcode::REQUEST),
            Err(SessionError::SessionClosed)
        ));
    }

    #[test]
    fn test_ids_are_monotonic_and_wrap() {
        let table = open_table(4);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let (seq, _rx) = table.register(opcode::REQUEST).unwrap();
            table.finish(seq, Completion::Cancelled);
            seen.push(seq);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_exhaustion_does_not_skip() {
        let table = open_table(4);
        let mut receivers = Vec::new();
        for _ in 0..4 {
            receivers.push(table.register(opcode::REQUEST).unwrap());
        }
        assert!(matches!(
            table.register(opcode::REQUEST),
            Err(SessionError::SequenceSpaceExhausted { pending: 4 })
        ));

        // Freeing a later id does not help: the next id in order is 0
        table.finish(2, Completion::Cancelled);
        assert!(table.register(opcode::REQUEST).is_err());

        table.finish(0, Completion::Cancelled);
        let (seq, _rx) = table.register(opcode::REQUEST).unwrap();
        assert_eq!(seq, 0);
    }

    #[test]
    fn test_route_completes_once() {
        let table = open_table(16);
        let (seq, mut rx) = table.register(opcode::REQUEST).unwrap();

        let response = Frame::new(seq, opcode::REQUEST, vec![0xAA]);
        assert!(matches!(
            table.route(response.clone()),
            Routed::Completed { .. }
        ));
        assert_eq!(rx.try_recv().unwrap().unwrap(), response);

        assert!(matches!(
            table.route(response),
            Routed::Duplicate {
                outcome: Completion::Completed,
                ..
            }
        ));
    }

    #[test]
    fn test_unmatched_frame_is_event() {
        let table = open_table(16);
        let frame = Frame::new(900, 0x40, vec![1]);
        assert!(matches!(table.route(frame), Routed::Unmatched(_)));
    }

    #[test]
    fn test_cancel_releases_waiter() {
        let table = open_table(16);
        let (seq, mut rx) = table.register(opcode::REQUEST).unwrap();

        assert!(table.finish(seq, Completion::Cancelled));
        assert_eq!(rx.try_recv().unwrap(), Err(SessionError::Cancelled(seq)));
        assert!(!table.finish(seq, Completion::Cancelled));
    }

    #[test]
    fn test_fail_all() {
        let table = open_table(16);
        let mut receivers: Vec<_> = (0..3)
            .map(|_| table.register(opcode::REQUEST).unwrap().1)
            .collect();

        assert_eq!(table.fail_all(SessionError::SessionClosed), 3);
        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), Err(SessionError::SessionClosed));
        }
        assert!(matches!(
            table.register(opcode::REQUEST),
            Err(SessionError::SessionClosed)
        ));
    }

    #[test]
    fn test_retired_ids_expire() {
        let table = PendingTable::new(16, Duration::from_millis(0));
        table.open();
        let (seq, _rx) = table.register(opcode::REQUEST).unwrap();
        table.finish(seq, Completion::TimedOut);

        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            table.route(Frame::new(seq, opcode::REQUEST, vec![])),
            Routed::Unmatched(_)
        ));
    }

    proptest! {
        /// No two simultaneously pending requests share an id, whatever the
        /// interleaving of sends and completions
        #[test]
        fn prop_pending_ids_unique(space in 2u32..32, ops in proptest::collection::vec(any::<Option<u8>>(), 1..200)) {
            let table = open_table(space);
            let mut outstanding: Vec<(SequenceId, oneshot::Receiver<Reply>)> = Vec::new();

            for op in ops {
                match op {
                    None => {
                        if let Ok(entry) = table.register(opcode::REQUEST) {
                            outstanding.push(entry);
                        }
                    }
                    Some(pick) if !outstanding.is_empty() => {
                        let (seq, _rx) = outstanding.remove(pick as usize % outstanding.len());
                        table.route(Frame::new(seq, opcode::REQUEST, vec![]));
                    }
                    Some(_) => {}
                }

                let ids: HashSet<SequenceId> = outstanding.iter().map(|(s, _)| *s).collect();
                prop_assert_eq!(ids.len(), outstanding.len());
                prop_assert_eq!(table.pending_count(), outstanding.len());
                prop_assert!(outstanding.len() <= space as usize);
            }
        }
    }
}
