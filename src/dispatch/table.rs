//! Request Dispatch Table
//!
//! The dispatch table correlates a future reply to the request that caused
//! it. Registration happens before a request's bytes hit the wire; when the
//! transport read path decodes a reply, [`DispatchTable::dispatch_reply`]
//! removes the matching entry and fires its completion handle exactly once.
//!
//! Entries are keyed by request id in a concurrent map, so senders on
//! unrelated connections never contend on a single lock. An unmatched reply
//! id is dropped with a diagnostic and disturbs nothing else.
//!
//! A pending entry for an acknowledged write is keyed by the *follow-up*
//! command's request id while storing the *original* write and its handle;
//! see `dispatch::write_concern` for how that pairing is produced.

use crate::dispatch::completion::{Completion, OpOutcome, WriteResult};
use crate::error::DriverError;
use crate::protocol::{Message, Reply};
use dashmap::DashMap;
use tracing::{debug, error, trace, warn};

/// How a pending entry's eventual reply is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    /// The reply is the operation's result, delivered as-is
    Read,
    /// The reply is a last-error acknowledgement for a write with
    /// `op_count` generated ids
    WriteAck { op_count: usize },
}

/// A registered operation awaiting its reply.
///
/// Lives from registration until a matching reply is observed; there is no
/// timeout here, so an entry whose reply never arrives simply stays pending.
#[derive(Debug)]
pub struct PendingOp {
    /// The originating message, kept for diagnostics
    message: Message,
    kind: PendingKind,
    completion: Completion,
}

impl PendingOp {
    /// A pending read-class operation.
    pub fn read(message: Message, completion: Completion) -> Self {
        Self {
            message,
            kind: PendingKind::Read,
            completion,
        }
    }

    /// A pending write acknowledgement: the stored message and handle belong
    /// to the original write, not the follow-up command.
    pub fn write_ack(message: Message, op_count: usize, completion: Completion) -> Self {
        Self {
            message,
            kind: PendingKind::WriteAck { op_count },
            completion,
        }
    }

    /// Fires the completion with an error.
    pub fn fail(self, err: DriverError) {
        self.completion.complete(Err(err));
    }

    fn resolve(self, reply: Reply) {
        match self.kind {
            PendingKind::Read => {
                self.completion.complete(Ok(OpOutcome::Reply(reply)));
            }
            PendingKind::WriteAck { op_count } => {
                let Some(doc) = reply.first_document() else {
                    self.completion
                        .complete(Err(DriverError::Malformed(
                            "empty acknowledgement reply".to_string(),
                        )));
                    return;
                };
                // A string "err" field means the write failed; null or
                // missing means it was applied.
                match doc.get_str("err") {
                    Some(message) => {
                        let code = doc.i32_or("code", 0);
                        self.completion.complete(Err(DriverError::WriteFailure {
                            code,
                            message: message.to_string(),
                        }));
                    }
                    None => {
                        self.completion.complete(Ok(OpOutcome::Writes(vec![
                            WriteResult::confirmed();
                            op_count
                        ])));
                    }
                }
            }
        }
    }
}

/// Concurrent map from in-flight request id to its pending operation.
#[derive(Debug, Default)]
pub struct DispatchTable {
    pending: DashMap<i32, PendingOp>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Registers a pending operation under `request_id`.
    ///
    /// Ids are a monotonic per-driver counter, so a displaced entry means the
    /// counter wrapped into a still-outstanding id. The displaced handle is
    /// failed with [`DriverError::IdCollision`] rather than silently leaked.
    pub fn register(&self, request_id: i32, op: PendingOp) {
        trace!(request_id, op = ?op.message.body(), "registering pending operation");
        if let Some(displaced) = self.pending.insert(request_id, op) {
            error!(request_id, "request id collision displaced a pending operation");
            displaced.fail(DriverError::IdCollision(request_id));
        }
    }

    /// Removes and returns the entry for `request_id`, if one exists.
    pub fn remove(&self, request_id: i32) -> Option<PendingOp> {
        self.pending.remove(&request_id).map(|(_, op)| op)
    }

    /// Routes an inbound reply to its pending operation.
    ///
    /// Returns true if a pending entry matched. An unmatched reply is dropped
    /// with a diagnostic; it never reaches a completion handle and never
    /// touches other entries.
    pub fn dispatch_reply(&self, reply: Reply) -> bool {
        match self.remove(reply.response_to) {
            Some(op) => {
                debug!(
                    request_id = reply.response_to,
                    documents = reply.documents.len(),
                    "reply matched pending operation"
                );
                op.resolve(reply);
                true
            }
            None => {
                warn!(
                    request_id = reply.response_to,
                    "dropping reply with no matching pending request"
                );
                false
            }
        }
    }

    /// Number of operations currently awaiting replies.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Document, Namespace, Value};

    fn query_message(id: i32) -> Message {
        Message::query(
            id,
            Namespace::new("db", "coll"),
            0,
            0,
            0,
            Document::new(),
            None,
        )
    }

    fn insert_message(id: i32, docs: usize) -> Message {
        Message::insert(
            id,
            Namespace::new("db", "coll"),
            (0..docs).map(|_| Document::new()).collect(),
        )
    }

    #[tokio::test]
    async fn test_read_reply_resolution() {
        let table = DispatchTable::new();
        let (completion, future) = Completion::channel();
        table.register(7, PendingOp::read(query_message(7), completion));
        assert_eq!(table.len(), 1);

        let matched = table.dispatch_reply(Reply::with_documents(
            7,
            vec![Document::new().with("x", 1)],
        ));
        assert!(matched);
        assert!(table.is_empty());

        let reply = future.wait().await.unwrap().into_reply().unwrap();
        assert_eq!(reply.first_document().unwrap().get_i32("x"), Some(1));
    }

    #[tokio::test]
    async fn test_write_ack_success() {
        let table = DispatchTable::new();
        let (completion, future) = Completion::channel();
        // keyed by the follow-up's id (21), payload is the original write
        table.register(21, PendingOp::write_ack(insert_message(20, 3), 3, completion));

        table.dispatch_reply(Reply::with_documents(
            21,
            vec![Document::new().with("ok", 1).with("err", Value::Null).with("n", 3)],
        ));

        let writes = future.wait().await.unwrap().into_writes().unwrap();
        assert_eq!(writes, vec![WriteResult::confirmed(); 3]);
    }

    #[tokio::test]
    async fn test_write_ack_failure_surfaces_error() {
        let table = DispatchTable::new();
        let (completion, future) = Completion::channel();
        table.register(9, PendingOp::write_ack(insert_message(8, 1), 1, completion));

        table.dispatch_reply(Reply::with_documents(
            9,
            vec![Document::new()
                .with("ok", 1)
                .with("err", "duplicate key")
                .with("code", 11000)],
        ));

        match future.wait().await {
            Err(DriverError::WriteFailure { code, message }) => {
                assert_eq!(code, 11000);
                assert_eq!(message, "duplicate key");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped_without_damage() {
        let table = DispatchTable::new();
        let (completion, mut future) = Completion::channel();
        table.register(3, PendingOp::read(query_message(3), completion));

        // Reply for a request nobody registered
        let matched = table.dispatch_reply(Reply::with_documents(999, vec![]));
        assert!(!matched);

        // The unrelated entry is intact and still resolvable
        assert_eq!(table.len(), 1);
        assert!(future.try_take().is_none());
        assert!(table.dispatch_reply(Reply::with_documents(3, vec![])));
        assert!(future.try_take().is_some());
    }

    #[tokio::test]
    async fn test_id_collision_fails_displaced_entry() {
        let table = DispatchTable::new();
        let (first, first_future) = Completion::channel();
        let (second, mut second_future) = Completion::channel();

        table.register(5, PendingOp::read(query_message(5), first));
        table.register(5, PendingOp::read(query_message(5), second));

        assert!(matches!(
            first_future.wait().await,
            Err(DriverError::IdCollision(5))
        ));
        // the new entry is the live one
        assert_eq!(table.len(), 1);
        table.dispatch_reply(Reply::with_documents(5, vec![]));
        assert!(second_future.try_take().is_some());
    }

    #[tokio::test]
    async fn test_empty_ack_reply_is_malformed() {
        let table = DispatchTable::new();
        let (completion, future) = Completion::channel();
        table.register(4, PendingOp::write_ack(insert_message(2, 1), 1, completion));
        table.dispatch_reply(Reply::with_documents(4, vec![]));
        assert!(matches!(
            future.wait().await,
            Err(DriverError::Malformed(_))
        ));
    }
}
