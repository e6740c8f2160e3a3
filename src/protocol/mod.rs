//! Wire Protocol Module
//!
//! This module implements the document-database wire format used by the
//! dispatch core: the ordered document value model, outgoing request
//! messages, and inbound reply frames.
//!
//! The dispatch core treats these as a narrow seam. It only relies on a
//! message exposing its request id, whether it is write-class, and a
//! serialize-to-buffer operation, and on a reply exposing the request id it
//! answers plus its decoded documents.

pub mod document;
pub mod message;
pub mod reply;

// Re-export commonly used types
pub use document::{Document, ParseError, ParseResult, Value};
pub use message::{Message, MessageBody, MessageHeader, Namespace};
pub use reply::Reply;
