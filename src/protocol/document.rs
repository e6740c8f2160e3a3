//! Document Value Model
//!
//! This module defines the document representation exchanged with the server:
//! an insertion-ordered list of key/value pairs with a compact binary
//! encoding. Key order matters on the wire (command documents put the command
//! name first), so documents preserve the order keys were inserted in.
//!
//! ## Encoding
//!
//! A document is encoded as:
//!
//! ```text
//! <total length: i32 LE> <element>* <0x00 terminator>
//! ```
//!
//! Each element is a type byte, a NUL-terminated key, and a type-specific
//! payload:
//!
//! - `0x01` double (f64 LE)
//! - `0x02` string (i32 length including NUL, bytes, NUL)
//! - `0x03` embedded document
//! - `0x04` array (encoded as a document with keys "0", "1", ...)
//! - `0x08` bool (one byte)
//! - `0x0A` null
//! - `0x10` int32 (i32 LE)
//! - `0x12` int64 (i64 LE)
//!
//! The parser is bounds-checked throughout: malformed input produces a
//! [`ParseError`], never a panic.

use bytes::{BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

/// Element type bytes used in the document encoding.
pub mod element {
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BOOL: u8 = 0x08;
    pub const NULL: u8 = 0x0A;
    pub const INT32: u8 = 0x10;
    pub const INT64: u8 = 0x12;
}

/// Maximum nesting depth accepted by the parser (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// Smallest possible encoded document: length prefix plus terminator
const MIN_DOCUMENT_LEN: usize = 5;

/// Errors that can occur while decoding documents or reply frames.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The input ended before the declared length
    #[error("truncated input")]
    Truncated,

    /// Unknown element type byte
    #[error("unknown element type: {0:#04x}")]
    UnknownElementType(u8),

    /// Invalid UTF-8 in a key or string value
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// A declared length is negative or impossibly small
    #[error("invalid {what} length: {len}")]
    InvalidLength { what: &'static str, len: i64 },

    /// Document nesting exceeds [`MAX_NESTING_DEPTH`]
    #[error("nesting too deep (max: {0})")]
    TooDeep(usize),

    /// Unknown opcode in a reply header
    #[error("unexpected opcode: {0}")]
    UnexpectedOpcode(i32),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// A single value inside a [`Document`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit IEEE float
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Embedded document
    Document(Document),
    /// Array of values
    Array(Vec<Value>),
    /// Boolean
    Bool(bool),
    /// Explicit null
    Null,
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
}

impl Value {
    /// Returns the value as an i64, coercing from the other numeric types.
    ///
    /// Servers are loose about integer width in status documents (an
    /// acknowledged count may arrive as a double), so numeric reads coerce.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(n) => Some(i64::from(*n)),
            Value::Int64(n) => Some(*n),
            Value::Double(d) => Some(*d as i64),
            _ => None,
        }
    }

    /// Returns the value as an i32, coercing from the other numeric types.
    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().map(|n| n as i32)
    }

    /// Returns the inner bool, if this is a Bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the inner string, if this is a String.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the inner document, if this is a Document.
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    /// Returns true if this value is Null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int32(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int64(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Document> for Value {
    fn from(d: Document) -> Self {
        Value::Document(d)
    }
}

/// An insertion-ordered document.
///
/// Keys keep the order they were inserted in, which is what the wire format
/// serializes. Inserting an existing key replaces its value in place without
/// moving it.
///
/// # Example
///
/// ```
/// use docwire::protocol::{Document, Value};
///
/// let doc = Document::new()
///     .with("getlasterror", 1)
///     .with("j", true);
///
/// assert_eq!(doc.get_i32("getlasterror"), Some(1));
/// assert_eq!(doc.get_bool("j"), Some(true));
/// assert!(doc.get("w").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts a key, replacing the value in place if the key already exists.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Typed accessor: i32 (coerces from the other numeric types).
    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(Value::as_i32)
    }

    /// Typed accessor: i64 (coerces from the other numeric types).
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Typed accessor: bool.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Typed accessor: string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Typed accessor: embedded document.
    pub fn get_doc(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Value::as_document)
    }

    /// Get-or-default accessor: i32.
    pub fn i32_or(&self, key: &str, default: i32) -> i32 {
        self.get_i32(key).unwrap_or(default)
    }

    /// Get-or-default accessor: i64.
    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.get_i64(key).unwrap_or(default)
    }

    /// Get-or-default accessor: bool.
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Get-or-default accessor: string.
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_str(key).unwrap_or(default)
    }

    /// Returns true if the document has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of top-level entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Compares two documents ignoring top-level key order.
    ///
    /// Useful where a caller built a document unordered but a test or a
    /// server status check only cares about content.
    pub fn eq_unordered(&self, other: &Document) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.get(k).map(|ov| ov == v).unwrap_or(false))
    }

    /// Returns true if this looks like a successful command reply
    /// (an `ok` field equal to 1, of any numeric width).
    pub fn command_ok(&self) -> bool {
        self.get_i64("ok") == Some(1)
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        // length prefix + elements + terminator
        4 + self
            .entries
            .iter()
            .map(|(k, v)| 1 + k.len() + 1 + value_encoded_len(v))
            .sum::<usize>()
            + 1
    }

    /// Serializes the document into an existing buffer.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_i32_le(0); // patched below
        for (key, value) in &self.entries {
            serialize_element(key, value, buf);
        }
        buf.put_u8(0);
        let total = (buf.len() - start) as i32;
        buf[start..start + 4].copy_from_slice(&total.to_le_bytes());
    }

    /// Serializes the document to a fresh byte vector.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.serialize_into(&mut buf);
        buf.to_vec()
    }

    /// Parses one document from the front of `input`.
    ///
    /// Returns the document and the number of bytes consumed. The input may
    /// contain trailing data (reply frames carry several documents back to
    /// back); the declared length decides how much is consumed.
    pub fn parse(input: &[u8]) -> ParseResult<(Document, usize)> {
        parse_document(input, 0)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Document(d) => write!(f, "{}", d),
            Value::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::Int32(n) => write!(f, "{}", n),
            Value::Int64(n) => write!(f, "{}", n),
        }
    }
}

fn value_encoded_len(value: &Value) -> usize {
    match value {
        Value::Double(_) => 8,
        Value::String(s) => 4 + s.len() + 1,
        Value::Document(d) => d.encoded_len(),
        Value::Array(values) => {
            // arrays encode as documents keyed by decimal index
            4 + values
                .iter()
                .enumerate()
                .map(|(i, v)| 1 + decimal_len(i) + 1 + value_encoded_len(v))
                .sum::<usize>()
                + 1
        }
        Value::Bool(_) => 1,
        Value::Null => 0,
        Value::Int32(_) => 4,
        Value::Int64(_) => 8,
    }
}

fn decimal_len(mut n: usize) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

fn serialize_element(key: &str, value: &Value, buf: &mut BytesMut) {
    let type_byte = match value {
        Value::Double(_) => element::DOUBLE,
        Value::String(_) => element::STRING,
        Value::Document(_) => element::DOCUMENT,
        Value::Array(_) => element::ARRAY,
        Value::Bool(_) => element::BOOL,
        Value::Null => element::NULL,
        Value::Int32(_) => element::INT32,
        Value::Int64(_) => element::INT64,
    };
    buf.put_u8(type_byte);
    buf.put_slice(key.as_bytes());
    buf.put_u8(0);
    match value {
        Value::Double(d) => buf.put_f64_le(*d),
        Value::String(s) => {
            buf.put_i32_le(s.len() as i32 + 1);
            buf.put_slice(s.as_bytes());
            buf.put_u8(0);
        }
        Value::Document(d) => d.serialize_into(buf),
        Value::Array(values) => {
            let start = buf.len();
            buf.put_i32_le(0);
            for (i, v) in values.iter().enumerate() {
                serialize_element(&i.to_string(), v, buf);
            }
            buf.put_u8(0);
            let total = (buf.len() - start) as i32;
            buf[start..start + 4].copy_from_slice(&total.to_le_bytes());
        }
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::Null => {}
        Value::Int32(n) => buf.put_i32_le(*n),
        Value::Int64(n) => buf.put_i64_le(*n),
    }
}

/// Reads a little-endian i32 at `pos`, bounds-checked.
fn read_i32(input: &[u8], pos: usize) -> ParseResult<i32> {
    let bytes = input
        .get(pos..pos + 4)
        .ok_or(ParseError::Truncated)?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    Ok(i32::from_le_bytes(arr))
}

fn read_i64(input: &[u8], pos: usize) -> ParseResult<i64> {
    let bytes = input
        .get(pos..pos + 8)
        .ok_or(ParseError::Truncated)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(i64::from_le_bytes(arr))
}

fn read_f64(input: &[u8], pos: usize) -> ParseResult<f64> {
    let bytes = input
        .get(pos..pos + 8)
        .ok_or(ParseError::Truncated)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(f64::from_le_bytes(arr))
}

/// Reads a NUL-terminated UTF-8 string starting at `pos`.
/// Returns the string and the position just past the terminator.
fn read_cstring(input: &[u8], pos: usize) -> ParseResult<(String, usize)> {
    let rest = input.get(pos..).ok_or(ParseError::Truncated)?;
    let nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or(ParseError::Truncated)?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    Ok((s.to_string(), pos + nul + 1))
}

fn parse_document(input: &[u8], depth: usize) -> ParseResult<(Document, usize)> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::TooDeep(MAX_NESTING_DEPTH));
    }

    let declared = read_i32(input, 0)?;
    if declared < MIN_DOCUMENT_LEN as i32 {
        return Err(ParseError::InvalidLength {
            what: "document",
            len: i64::from(declared),
        });
    }
    let declared = declared as usize;
    if input.len() < declared {
        return Err(ParseError::Truncated);
    }

    let mut doc = Document::new();
    let mut pos = 4;
    let end = declared - 1; // last byte is the terminator

    while pos < end {
        let type_byte = *input.get(pos).ok_or(ParseError::Truncated)?;
        pos += 1;
        let (key, next) = read_cstring(input, pos)?;
        pos = next;
        let (value, next) = parse_value(type_byte, input, pos, depth)?;
        pos = next;
        doc.entries.push((key, value));
    }

    if input.get(end) != Some(&0) {
        return Err(ParseError::InvalidLength {
            what: "document terminator",
            len: declared as i64,
        });
    }

    Ok((doc, declared))
}

fn parse_value(
    type_byte: u8,
    input: &[u8],
    pos: usize,
    depth: usize,
) -> ParseResult<(Value, usize)> {
    match type_byte {
        element::DOUBLE => Ok((Value::Double(read_f64(input, pos)?), pos + 8)),
        element::STRING => {
            let len = read_i32(input, pos)?;
            if len < 1 {
                return Err(ParseError::InvalidLength {
                    what: "string",
                    len: i64::from(len),
                });
            }
            let len = len as usize;
            let bytes = input
                .get(pos + 4..pos + 4 + len - 1)
                .ok_or(ParseError::Truncated)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok((Value::String(s.to_string()), pos + 4 + len))
        }
        element::DOCUMENT => {
            let rest = input.get(pos..).ok_or(ParseError::Truncated)?;
            let (doc, consumed) = parse_document(rest, depth + 1)?;
            Ok((Value::Document(doc), pos + consumed))
        }
        element::ARRAY => {
            let rest = input.get(pos..).ok_or(ParseError::Truncated)?;
            let (doc, consumed) = parse_document(rest, depth + 1)?;
            let values = doc.entries.into_iter().map(|(_, v)| v).collect();
            Ok((Value::Array(values), pos + consumed))
        }
        element::BOOL => {
            let b = *input.get(pos).ok_or(ParseError::Truncated)?;
            Ok((Value::Bool(b != 0), pos + 1))
        }
        element::NULL => Ok((Value::Null, pos)),
        element::INT32 => Ok((Value::Int32(read_i32(input, pos)?), pos + 4)),
        element::INT64 => Ok((Value::Int64(read_i64(input, pos)?), pos + 8)),
        other => Err(ParseError::UnknownElementType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_serialize() {
        let doc = Document::new();
        // 4 length bytes + terminator
        assert_eq!(doc.serialize(), vec![5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_int32_roundtrip() {
        let doc = Document::new().with("n", 42);
        let bytes = doc.serialize();
        let (parsed, consumed) = Document::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.get_i32("n"), Some(42));
    }

    #[test]
    fn test_mixed_roundtrip() {
        let doc = Document::new()
            .with("name", "docwire")
            .with("count", 7i64)
            .with("ratio", 0.5)
            .with("active", true)
            .with("missing", Value::Null)
            .with("inner", Document::new().with("x", 1))
            .with(
                "ids",
                Value::Array(vec![Value::Int64(5), Value::Int64(6), Value::Int64(7)]),
            );

        let bytes = doc.serialize();
        let (parsed, consumed) = Document::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, doc);
        assert_eq!(parsed.get_str("name"), Some("docwire"));
        assert_eq!(parsed.get_i64("count"), Some(7));
        assert_eq!(parsed.get_bool("active"), Some(true));
        assert_eq!(parsed.get_doc("inner").unwrap().get_i32("x"), Some(1));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let doc = Document::new()
            .with("findandmodify", "users")
            .with("query", Document::new())
            .with("update", Document::new());

        let keys: Vec<&str> = doc.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["findandmodify", "query", "update"]);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut doc = Document::new().with("a", 1).with("b", 2);
        doc.insert("a", 10);
        let keys: Vec<&str> = doc.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(doc.get_i32("a"), Some(10));
    }

    #[test]
    fn test_eq_unordered() {
        let a = Document::new().with("x", 1).with("y", 2);
        let b = Document::new().with("y", 2).with("x", 1);
        assert_ne!(a, b);
        assert!(a.eq_unordered(&b));
        assert!(!a.eq_unordered(&Document::new().with("x", 1)));
    }

    #[test]
    fn test_numeric_coercion() {
        let doc = Document::new().with("ok", 1.0).with("n", 3i64);
        assert!(doc.command_ok());
        assert_eq!(doc.get_i32("n"), Some(3));
    }

    #[test]
    fn test_get_or_default_accessors() {
        let doc = Document::new().with("ismaster", true);
        assert!(doc.bool_or("ismaster", false));
        assert!(!doc.bool_or("secondary", false));
        assert_eq!(doc.i32_or("maxMessageSizeBytes", 4_194_304), 4_194_304);
        assert_eq!(doc.str_or("msg", "none"), "none");
    }

    #[test]
    fn test_truncated_input() {
        let doc = Document::new().with("key", "value");
        let bytes = doc.serialize();
        assert_eq!(
            Document::parse(&bytes[..bytes.len() - 2]),
            Err(ParseError::Truncated)
        );
    }

    #[test]
    fn test_invalid_declared_length() {
        let bytes = vec![2, 0, 0, 0, 0];
        assert!(matches!(
            Document::parse(&bytes),
            Err(ParseError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_unknown_element_type() {
        let mut doc = Document::new().with("k", 1).serialize();
        doc[4] = 0x7F; // stomp the element type byte
        assert_eq!(
            Document::parse(&doc),
            Err(ParseError::UnknownElementType(0x7F))
        );
    }

    #[test]
    fn test_nesting_depth_guard() {
        let mut doc = Document::new().with("leaf", 1);
        for _ in 0..(MAX_NESTING_DEPTH + 2) {
            doc = Document::new().with("d", doc);
        }
        let bytes = doc.serialize();
        assert_eq!(
            Document::parse(&bytes),
            Err(ParseError::TooDeep(MAX_NESTING_DEPTH))
        );
    }

    #[test]
    fn test_display() {
        let doc = Document::new().with("a", 1).with("b", "two");
        assert_eq!(doc.to_string(), "{a: 1, b: \"two\"}");
    }
}
