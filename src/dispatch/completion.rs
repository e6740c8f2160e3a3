//! Completion Handles
//!
//! Every operation submitted to the dispatch core carries a [`Completion`]:
//! a single-fulfillment handle that fires exactly once with the operation's
//! outcome. The submitting caller keeps the matching [`ReplyFuture`] and
//! awaits it wherever convenient; nothing about completion is tied to the
//! caller's execution context.
//!
//! `Completion` is not clonable and `complete` consumes it, so the
//! at-most-once guarantee is structural rather than policed at runtime.
//! Fire-and-forget sends (cursor reclamation) use [`Completion::discard`],
//! which swallows its outcome.

use crate::error::{DriverError, DriverResult};
use crate::protocol::Reply;
use tokio::sync::oneshot;

/// The per-id result of a write-class operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// True when the server confirmed the write through the acknowledgement
    /// protocol; false for the synthetic results of unacknowledged writes.
    pub acknowledged: bool,
}

impl WriteResult {
    /// A synthetic success, reported immediately after an unacknowledged
    /// write is flushed.
    pub fn synthetic() -> Self {
        Self {
            acknowledged: false,
        }
    }

    /// A server-confirmed success.
    pub fn confirmed() -> Self {
        Self { acknowledged: true }
    }
}

/// The outcome delivered through a completion handle.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    /// A read-class operation's decoded reply
    Reply(Reply),
    /// A write-class operation's per-id results
    Writes(Vec<WriteResult>),
    /// The message was flushed and no reply is expected (kill-cursors)
    Sent,
}

impl OpOutcome {
    /// Unwraps a reply outcome; anything else is a shape violation.
    pub fn into_reply(self) -> DriverResult<Reply> {
        match self {
            OpOutcome::Reply(reply) => Ok(reply),
            _ => Err(DriverError::ProtocolShape { op: "read-class" }),
        }
    }

    /// Unwraps write results; anything else is a shape violation.
    pub fn into_writes(self) -> DriverResult<Vec<WriteResult>> {
        match self {
            OpOutcome::Writes(results) => Ok(results),
            _ => Err(DriverError::ProtocolShape { op: "write-class" }),
        }
    }
}

/// Caller-supplied handle fired exactly once with an operation's outcome.
#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<DriverResult<OpOutcome>>>,
}

impl Completion {
    /// Creates a completion and the future that observes it.
    pub fn channel() -> (Self, ReplyFuture) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, ReplyFuture { rx })
    }

    /// A completion that drops its outcome, for fire-and-forget sends.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Fires the handle. The outcome is dropped if the waiter is gone or the
    /// handle was created with [`Completion::discard`].
    pub fn complete(mut self, outcome: DriverResult<OpOutcome>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Awaits the outcome of a submitted operation.
///
/// If the driver is torn down before the operation resolves, waiting yields
/// [`DriverError::ConnectionClosed`]. A reply that simply never arrives (the
/// server died, the connection dropped) resolves nothing: callers needing
/// timeouts wrap this future in their own watchdog.
#[derive(Debug)]
pub struct ReplyFuture {
    rx: oneshot::Receiver<DriverResult<OpOutcome>>,
}

impl ReplyFuture {
    /// Waits for the operation's outcome.
    pub async fn wait(self) -> DriverResult<OpOutcome> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DriverError::ConnectionClosed),
        }
    }

    /// Non-blocking poll for an already-delivered outcome.
    pub fn try_take(&mut self) -> Option<DriverResult<OpOutcome>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Document;

    #[tokio::test]
    async fn test_completion_delivers_outcome() {
        let (completion, future) = Completion::channel();
        completion.complete(Ok(OpOutcome::Reply(Reply::with_documents(
            1,
            vec![Document::new().with("ok", 1)],
        ))));

        let reply = future.wait().await.unwrap().into_reply().unwrap();
        assert!(reply.first_document().unwrap().command_ok());
    }

    #[tokio::test]
    async fn test_dropped_completion_reports_closed() {
        let (completion, future) = Completion::channel();
        drop(completion);
        assert!(matches!(
            future.wait().await,
            Err(DriverError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_discard_swallows_outcome() {
        Completion::discard().complete(Ok(OpOutcome::Sent));
    }

    #[tokio::test]
    async fn test_try_take() {
        let (completion, mut future) = Completion::channel();
        assert!(future.try_take().is_none());
        completion.complete(Ok(OpOutcome::Sent));
        assert!(matches!(future.try_take(), Some(Ok(OpOutcome::Sent))));
    }

    #[test]
    fn test_outcome_shape_errors() {
        assert!(matches!(
            OpOutcome::Sent.into_reply(),
            Err(DriverError::ProtocolShape { .. })
        ));
        assert!(matches!(
            OpOutcome::Reply(Reply::with_documents(1, vec![])).into_writes(),
            Err(DriverError::ProtocolShape { .. })
        ));
    }
}
