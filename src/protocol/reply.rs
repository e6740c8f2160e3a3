//! Inbound Reply Frames
//!
//! The server answers read-class messages with a single reply frame:
//!
//! ```text
//! <header> <flags: i32> <cursor id: i64> <starting from: i32>
//! <number returned: i32> <document>*
//! ```
//!
//! The header's `response_to` field carries the request id the reply answers;
//! the dispatch table uses it to find the pending operation. Parsing is
//! bounds-checked and never panics on malformed input.

use crate::protocol::document::{Document, ParseError, ParseResult};
use crate::protocol::message::{opcode, MessageHeader};
use bytes::{BufMut, BytesMut};

/// Reply flag bits.
pub mod reply_flag {
    /// The cursor id in a get-more was not known to the server
    pub const CURSOR_NOT_FOUND: i32 = 1;
    /// The query failed; the single returned document describes the error
    pub const QUERY_FAILURE: i32 = 1 << 1;
}

/// A decoded reply frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Request id this reply answers
    pub response_to: i32,
    /// Reply flag bits
    pub flags: i32,
    /// Cursor id for follow-up get-more calls, zero when exhausted
    pub cursor_id: i64,
    /// Offset of the first returned document within the cursor
    pub starting_from: i32,
    /// Returned documents
    pub documents: Vec<Document>,
}

impl Reply {
    /// Convenience constructor for a plain document reply.
    pub fn with_documents(response_to: i32, documents: Vec<Document>) -> Self {
        Self {
            response_to,
            flags: 0,
            cursor_id: 0,
            starting_from: 0,
            documents,
        }
    }

    /// Parses a complete reply frame, header included.
    pub fn parse(frame: &[u8]) -> ParseResult<Self> {
        let header = MessageHeader::parse(frame)?;
        if header.op_code != opcode::REPLY {
            return Err(ParseError::UnexpectedOpcode(header.op_code));
        }
        if header.message_length < (MessageHeader::LEN + 20) as i32 {
            return Err(ParseError::InvalidLength {
                what: "reply frame",
                len: i64::from(header.message_length),
            });
        }
        if frame.len() < header.message_length as usize {
            return Err(ParseError::Truncated);
        }

        let field_i32 = |pos: usize| -> ParseResult<i32> {
            let bytes = frame.get(pos..pos + 4).ok_or(ParseError::Truncated)?;
            let mut arr = [0u8; 4];
            arr.copy_from_slice(bytes);
            Ok(i32::from_le_bytes(arr))
        };

        let flags = field_i32(16)?;
        let cursor_id = {
            let bytes = frame.get(20..28).ok_or(ParseError::Truncated)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(bytes);
            i64::from_le_bytes(arr)
        };
        let starting_from = field_i32(28)?;
        let number_returned = field_i32(32)?;
        if number_returned < 0 {
            return Err(ParseError::InvalidLength {
                what: "reply document count",
                len: i64::from(number_returned),
            });
        }

        let mut documents = Vec::with_capacity(number_returned as usize);
        let mut pos = 36;
        for _ in 0..number_returned {
            let rest = frame.get(pos..).ok_or(ParseError::Truncated)?;
            let (doc, consumed) = Document::parse(rest)?;
            documents.push(doc);
            pos += consumed;
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }

    /// Serializes this reply to a complete frame.
    ///
    /// The dispatch core only consumes replies; this exists so tests and
    /// tooling can synthesize server traffic.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_i32_le(0); // length, patched below
        buf.put_i32_le(0); // request id of the reply itself, unused here
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(opcode::REPLY);
        buf.put_i32_le(self.flags);
        buf.put_i64_le(self.cursor_id);
        buf.put_i32_le(self.starting_from);
        buf.put_i32_le(self.documents.len() as i32);
        for doc in &self.documents {
            doc.serialize_into(&mut buf);
        }
        let total = buf.len() as i32;
        buf[0..4].copy_from_slice(&total.to_le_bytes());
        buf.to_vec()
    }

    /// True if the server did not recognize the requested cursor.
    pub fn is_cursor_not_found(&self) -> bool {
        self.flags & reply_flag::CURSOR_NOT_FOUND != 0
    }

    /// True if the query failed server-side.
    pub fn is_query_failure(&self) -> bool {
        self.flags & reply_flag::QUERY_FAILURE != 0
    }

    /// The first returned document, if any.
    pub fn first_document(&self) -> Option<&Document> {
        self.documents.first()
    }
}
