//! Outgoing Wire Messages
//!
//! This module defines the request messages the dispatch core puts on the
//! wire. Every message starts with a fixed 16-byte header:
//!
//! ```text
//! <message length: i32> <request id: i32> <response to: i32> <opcode: i32>
//! ```
//!
//! all little-endian, followed by an opcode-specific body. The request id is
//! assigned by the driver when the message is built and is what a later reply
//! correlates against.
//!
//! Write-class messages (insert, update, delete) carry no native reply; the
//! acknowledgement protocol in `dispatch::write_concern` decides whether a
//! follow-up command is flushed with them. Kill-cursors is fire-and-forget:
//! not write-class, but it expects no reply either.

use crate::protocol::document::{Document, ParseError, ParseResult};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Opcodes used in message headers.
pub mod opcode {
    pub const REPLY: i32 = 1;
    pub const UPDATE: i32 = 2001;
    pub const INSERT: i32 = 2002;
    pub const QUERY: i32 = 2004;
    pub const GET_MORE: i32 = 2005;
    pub const DELETE: i32 = 2006;
    pub const KILL_CURSORS: i32 = 2007;
}

/// Query flag bits.
pub mod query_flag {
    pub const TAILABLE_CURSOR: i32 = 1 << 1;
    pub const SLAVE_OK: i32 = 1 << 2;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const AWAIT_DATA: i32 = 1 << 5;
}

/// Update flag bits.
pub mod update_flag {
    pub const UPSERT: i32 = 1;
    pub const MULTI: i32 = 1 << 1;
}

/// Delete flag bits.
pub mod delete_flag {
    pub const SINGLE_REMOVE: i32 = 1;
}

/// The fixed message header shared by every frame, inbound and outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total frame length in bytes, header included
    pub message_length: i32,
    /// Identifier assigned by the sender
    pub request_id: i32,
    /// For replies, the request id this answers; zero on requests
    pub response_to: i32,
    /// One of the [`opcode`] constants
    pub op_code: i32,
}

impl MessageHeader {
    /// Encoded header size in bytes.
    pub const LEN: usize = 16;

    /// Parses a header from the front of `input`.
    pub fn parse(input: &[u8]) -> ParseResult<Self> {
        if input.len() < Self::LEN {
            return Err(ParseError::Truncated);
        }
        let field = |i: usize| {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(&input[i..i + 4]);
            i32::from_le_bytes(arr)
        };
        Ok(Self {
            message_length: field(0),
            request_id: field(4),
            response_to: field(8),
            op_code: field(12),
        })
    }
}

/// A namespace: database plus collection, `"db.collection"` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// The `$cmd` pseudo-collection commands are queried against.
    pub fn command(database: impl Into<String>) -> Self {
        Self::new(database, "$cmd")
    }

    /// The dotted form written on the wire.
    pub fn full(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// An outgoing request message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    request_id: i32,
    body: MessageBody,
}

/// Opcode-specific message bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Query {
        ns: Namespace,
        flags: i32,
        skip: i32,
        limit: i32,
        query: Document,
        fields: Option<Document>,
    },
    GetMore {
        ns: Namespace,
        limit: i32,
        cursor_id: i64,
    },
    Insert {
        ns: Namespace,
        documents: Vec<Document>,
    },
    Update {
        ns: Namespace,
        flags: i32,
        selector: Document,
        update: Document,
    },
    Delete {
        ns: Namespace,
        flags: i32,
        selector: Document,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
}

impl Message {
    /// Builds a query message.
    pub fn query(
        request_id: i32,
        ns: Namespace,
        flags: i32,
        skip: i32,
        limit: i32,
        query: Document,
        fields: Option<Document>,
    ) -> Self {
        Self {
            request_id,
            body: MessageBody::Query {
                ns,
                flags,
                skip,
                limit,
                query,
                fields,
            },
        }
    }

    /// Builds a command: a single-result query against the `$cmd` collection.
    pub fn command(request_id: i32, database: impl Into<String>, command: Document) -> Self {
        Self::query(
            request_id,
            Namespace::command(database),
            0,
            0,
            -1,
            command,
            None,
        )
    }

    /// Builds a get-more message for an open cursor.
    pub fn get_more(request_id: i32, ns: Namespace, limit: i32, cursor_id: i64) -> Self {
        Self {
            request_id,
            body: MessageBody::GetMore {
                ns,
                limit,
                cursor_id,
            },
        }
    }

    /// Builds an insert message.
    pub fn insert(request_id: i32, ns: Namespace, documents: Vec<Document>) -> Self {
        Self {
            request_id,
            body: MessageBody::Insert { ns, documents },
        }
    }

    /// Builds an update message.
    pub fn update(
        request_id: i32,
        ns: Namespace,
        flags: i32,
        selector: Document,
        update: Document,
    ) -> Self {
        Self {
            request_id,
            body: MessageBody::Update {
                ns,
                flags,
                selector,
                update,
            },
        }
    }

    /// Builds a delete message.
    pub fn delete(request_id: i32, ns: Namespace, flags: i32, selector: Document) -> Self {
        Self {
            request_id,
            body: MessageBody::Delete { ns, flags, selector },
        }
    }

    /// Builds a kill-cursors message reclaiming the given server-side cursors.
    pub fn kill_cursors(request_id: i32, cursor_ids: Vec<i64>) -> Self {
        Self {
            request_id,
            body: MessageBody::KillCursors { cursor_ids },
        }
    }

    /// The request id stamped into the header.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// The body of this message.
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// The opcode written into the header.
    pub fn op_code(&self) -> i32 {
        match &self.body {
            MessageBody::Query { .. } => opcode::QUERY,
            MessageBody::GetMore { .. } => opcode::GET_MORE,
            MessageBody::Insert { .. } => opcode::INSERT,
            MessageBody::Update { .. } => opcode::UPDATE,
            MessageBody::Delete { .. } => opcode::DELETE,
            MessageBody::KillCursors { .. } => opcode::KILL_CURSORS,
        }
    }

    /// True for write-class messages: they carry no native reply and go
    /// through the acknowledgement protocol.
    pub fn is_write(&self) -> bool {
        matches!(
            &self.body,
            MessageBody::Insert { .. } | MessageBody::Update { .. } | MessageBody::Delete { .. }
        )
    }

    /// True if the server answers this message with exactly one reply.
    pub fn expects_reply(&self) -> bool {
        matches!(
            &self.body,
            MessageBody::Query { .. } | MessageBody::GetMore { .. }
        )
    }

    /// For write-class messages, the number of per-id results a completion
    /// handle receives (one per inserted document, one for update/delete).
    pub fn write_op_count(&self) -> usize {
        match &self.body {
            MessageBody::Insert { documents, .. } => documents.len(),
            MessageBody::Update { .. } | MessageBody::Delete { .. } => 1,
            _ => 0,
        }
    }

    /// The database this message targets, if it targets one.
    pub fn database(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Query { ns, .. }
            | MessageBody::GetMore { ns, .. }
            | MessageBody::Insert { ns, .. }
            | MessageBody::Update { ns, .. }
            | MessageBody::Delete { ns, .. } => Some(&ns.database),
            MessageBody::KillCursors { .. } => None,
        }
    }

    /// Serializes header and body into `buf`.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_i32_le(0); // length, patched once the body is written
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(0); // response_to
        buf.put_i32_le(self.op_code());

        match &self.body {
            MessageBody::Query {
                ns,
                flags,
                skip,
                limit,
                query,
                fields,
            } => {
                buf.put_i32_le(*flags);
                put_cstring(buf, &ns.full());
                buf.put_i32_le(*skip);
                buf.put_i32_le(*limit);
                query.serialize_into(buf);
                if let Some(fields) = fields {
                    fields.serialize_into(buf);
                }
            }
            MessageBody::GetMore {
                ns,
                limit,
                cursor_id,
            } => {
                buf.put_i32_le(0);
                put_cstring(buf, &ns.full());
                buf.put_i32_le(*limit);
                buf.put_i64_le(*cursor_id);
            }
            MessageBody::Insert { ns, documents } => {
                buf.put_i32_le(0);
                put_cstring(buf, &ns.full());
                for doc in documents {
                    doc.serialize_into(buf);
                }
            }
            MessageBody::Update {
                ns,
                flags,
                selector,
                update,
            } => {
                buf.put_i32_le(0);
                put_cstring(buf, &ns.full());
                buf.put_i32_le(*flags);
                selector.serialize_into(buf);
                update.serialize_into(buf);
            }
            MessageBody::Delete { ns, flags, selector } => {
                buf.put_i32_le(0);
                put_cstring(buf, &ns.full());
                buf.put_i32_le(*flags);
                selector.serialize_into(buf);
            }
            MessageBody::KillCursors { cursor_ids } => {
                buf.put_i32_le(0);
                buf.put_i32_le(cursor_ids.len() as i32);
                for id in cursor_ids {
                    buf.put_i64_le(*id);
                }
            }
        }

        let total = (buf.len() - start) as i32;
        buf[start..start + 4].copy_from_slice(&total.to_le_bytes());
    }

    /// Serializes to a fresh byte vector.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);
        self.serialize_into(&mut buf);
        buf.to_vec()
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let msg = Message::query(
            99,
            Namespace::new("db", "coll"),
            0,
            0,
            10,
            Document::new(),
            None,
        );
        let bytes = msg.serialize();
        let header = MessageHeader::parse(&bytes).unwrap();
        assert_eq!(header.message_length as usize, bytes.len());
        assert_eq!(header.request_id, 99);
        assert_eq!(header.response_to, 0);
        assert_eq!(header.op_code, opcode::QUERY);
    }

    #[test]
    fn test_write_class_discriminator() {
        let ns = Namespace::new("db", "coll");
        let insert = Message::insert(1, ns.clone(), vec![Document::new()]);
        let update = Message::update(2, ns.clone(), 0, Document::new(), Document::new());
        let delete = Message::delete(3, ns.clone(), 0, Document::new());
        let query = Message::query(4, ns.clone(), 0, 0, 0, Document::new(), None);
        let kill = Message::kill_cursors(5, vec![1]);

        assert!(insert.is_write() && !insert.expects_reply());
        assert!(update.is_write() && !update.expects_reply());
        assert!(delete.is_write() && !delete.expects_reply());
        assert!(!query.is_write() && query.expects_reply());
        assert!(!kill.is_write() && !kill.expects_reply());
    }

    #[test]
    fn test_write_op_count() {
        let ns = Namespace::new("db", "coll");
        let docs = vec![Document::new(), Document::new(), Document::new()];
        assert_eq!(Message::insert(1, ns.clone(), docs).write_op_count(), 3);
        assert_eq!(
            Message::update(2, ns.clone(), 0, Document::new(), Document::new()).write_op_count(),
            1
        );
        assert_eq!(
            Message::query(3, ns, 0, 0, 0, Document::new(), None).write_op_count(),
            0
        );
    }

    #[test]
    fn test_command_targets_cmd_collection() {
        let cmd = Message::command(7, "admin", Document::new().with("ismaster", 1));
        match cmd.body() {
            MessageBody::Query { ns, limit, .. } => {
                assert_eq!(ns.full(), "admin.$cmd");
                assert_eq!(*limit, -1);
            }
            other => panic!("unexpected body: {:?}", other),
        }
        assert_eq!(cmd.database(), Some("admin"));
    }

    #[test]
    fn test_kill_cursors_body() {
        let msg = Message::kill_cursors(11, vec![5, 6, 7]);
        let bytes = msg.serialize();
        // header, ZERO, count, then three i64 ids
        assert_eq!(bytes.len(), 16 + 4 + 4 + 3 * 8);
        let count = i32::from_le_bytes(bytes[20..24].try_into().unwrap());
        assert_eq!(count, 3);
        let first = i64::from_le_bytes(bytes[24..32].try_into().unwrap());
        assert_eq!(first, 5);
        assert_eq!(msg.database(), None);
    }

    #[test]
    fn test_update_flags_serialized() {
        let msg = Message::update(
            9,
            Namespace::new("db", "c"),
            update_flag::UPSERT | update_flag::MULTI,
            Document::new(),
            Document::new(),
        );
        let bytes = msg.serialize();
        // flags sit after the header, the ZERO word, and the namespace
        let at = 16 + 4 + "db.c".len() + 1;
        let flags = i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        assert_eq!(flags, update_flag::UPSERT | update_flag::MULTI);
    }

    #[test]
    fn test_query_flags_serialized() {
        let msg = Message::query(
            10,
            Namespace::new("db", "c"),
            query_flag::SLAVE_OK | query_flag::NO_CURSOR_TIMEOUT,
            0,
            0,
            Document::new(),
            None,
        );
        let bytes = msg.serialize();
        let flags = i32::from_le_bytes(bytes[16..20].try_into().unwrap());
        assert_eq!(flags, query_flag::SLAVE_OK | query_flag::NO_CURSOR_TIMEOUT);
    }

    #[test]
    fn test_delete_single_remove_flag() {
        let msg = Message::delete(
            11,
            Namespace::new("db", "c"),
            delete_flag::SINGLE_REMOVE,
            Document::new(),
        );
        let bytes = msg.serialize();
        let at = 16 + 4 + "db.c".len() + 1;
        let flags = i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        assert_eq!(flags, delete_flag::SINGLE_REMOVE);
    }

    #[test]
    fn test_insert_carries_all_documents() {
        let docs = vec![
            Document::new().with("i", 0),
            Document::new().with("i", 1),
        ];
        let msg = Message::insert(1, Namespace::new("db", "c"), docs.clone());
        let bytes = msg.serialize();

        // body: flags + cstring("db.c") + two documents
        let mut expected = 16 + 4 + 5;
        for doc in &docs {
            expected += doc.encoded_len();
        }
        assert_eq!(bytes.len(), expected);
    }
}
