//! Connection State Tracker
//!
//! Tracks connected/disconnected per connection and owns the FIFO queue of
//! operations submitted while disconnected.
//!
//! ## State machine
//!
//! ```text
//! DISCONNECTED ──handshake ok──▶ CONNECTED
//!      ▲                            │
//!      └──────close / failure───────┘
//! ```
//!
//! `CONNECTING` is implicit inside the handshake call and never separately
//! observable.
//!
//! The flag and the pending queue live under one mutex: a transition to
//! connected and the drain of the queue are a single critical section, so a
//! concurrent submission either lands in the queue before the drain or
//! observes the connected state and transmits directly. The critical section
//! only moves queue entries; it never touches the network.

use crate::dispatch::{Completion, WriteConcern};
use crate::protocol::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// An operation captured while its connection was disconnected.
///
/// Replayed in submission order once the connection comes up, with the
/// then-known maximum message size in force.
#[derive(Debug)]
pub struct DeferredOp {
    pub message: Message,
    /// Concern for write-class messages; `None` means the driver default
    pub concern: Option<WriteConcern>,
    pub completion: Completion,
}

/// What happened to a submission handed to [`ConnectionState::defer`].
#[derive(Debug)]
pub enum DeferOutcome {
    /// Queued for replay on reconnect
    Queued,
    /// The connection came up concurrently; the caller should transmit now
    Connected(DeferredOp),
    /// The queue is at its configured bound; the op was not queued
    Full(DeferredOp),
}

/// Connected/disconnected tracker plus the per-connection pending queue.
#[derive(Debug)]
pub struct ConnectionState {
    /// Lock-free mirror of the flag inside `inner`, for fast-path reads
    connected: AtomicBool,
    inner: Mutex<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    connected: bool,
    pending: VecDeque<DeferredOp>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    /// A fresh tracker in the disconnected state.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            inner: Mutex::new(StateInner {
                connected: false,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of operations waiting for reconnect.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Queues an operation for replay, re-checking the connected flag under
    /// the lock so a submission can never slip between a transition and its
    /// drain.
    pub fn defer(&self, op: DeferredOp, limit: usize) -> DeferOutcome {
        let mut inner = self.inner.lock().unwrap();
        if inner.connected {
            return DeferOutcome::Connected(op);
        }
        if inner.pending.len() >= limit {
            return DeferOutcome::Full(op);
        }
        inner.pending.push_back(op);
        DeferOutcome::Queued
    }

    /// Idempotent state transition.
    ///
    /// On `false → true` the entire pending queue is taken and returned for
    /// the caller to replay, in submission order, outside the lock. Every
    /// other transition is bookkeeping only and returns nothing.
    pub fn set_connected(&self, connected: bool) -> Vec<DeferredOp> {
        let mut inner = self.inner.lock().unwrap();
        if inner.connected == connected {
            return Vec::new();
        }
        inner.connected = connected;
        self.connected.store(connected, Ordering::Release);
        if connected {
            inner.pending.drain(..).collect()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Document, Namespace};

    fn deferred(i: i32) -> DeferredOp {
        DeferredOp {
            message: Message::query(
                i,
                Namespace::new("db", "coll"),
                0,
                0,
                0,
                Document::new().with("i", i),
                None,
            ),
            concern: None,
            completion: Completion::discard(),
        }
    }

    #[test]
    fn test_starts_disconnected() {
        let state = ConnectionState::new();
        assert!(!state.is_connected());
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn test_drain_preserves_fifo_order() {
        let state = ConnectionState::new();
        for i in 0..5 {
            assert!(matches!(state.defer(deferred(i), 64), DeferOutcome::Queued));
        }

        let drained = state.set_connected(true);
        let ids: Vec<i32> = drained.iter().map(|op| op.message.request_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn test_repeated_transition_is_bookkeeping_only() {
        let state = ConnectionState::new();
        state.defer(deferred(1), 64);
        assert_eq!(state.set_connected(true).len(), 1);

        // true → true must not drain or re-execute anything
        assert!(state.set_connected(true).is_empty());
        // and false → false is just as inert
        assert!(state.set_connected(false).is_empty());
        assert!(state.set_connected(false).is_empty());
    }

    #[test]
    fn test_disconnect_keeps_queue_for_next_connect() {
        let state = ConnectionState::new();
        state.set_connected(true);
        assert!(state.set_connected(false).is_empty());

        state.defer(deferred(7), 64);
        let drained = state.set_connected(true);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message.request_id(), 7);
    }

    #[test]
    fn test_queue_bound() {
        let state = ConnectionState::new();
        assert!(matches!(state.defer(deferred(1), 2), DeferOutcome::Queued));
        assert!(matches!(state.defer(deferred(2), 2), DeferOutcome::Queued));
        match state.defer(deferred(3), 2) {
            DeferOutcome::Full(op) => assert_eq!(op.message.request_id(), 3),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(state.pending_len(), 2);
    }

    #[test]
    fn test_defer_after_connect_reports_connected() {
        let state = ConnectionState::new();
        state.set_connected(true);
        assert!(matches!(
            state.defer(deferred(1), 64),
            DeferOutcome::Connected(_)
        ));
    }
}
