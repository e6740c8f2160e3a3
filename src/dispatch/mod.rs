//! Dispatch Module
//!
//! Correlates asynchronous server replies to the pending request that
//! produced them, and implements the write-acknowledgement protocol.
//!
//! ```text
//! caller ──▶ Connection::send ──▶ ┌─────────────────┐
//!                                 │  DispatchTable  │  request id → pending op
//!                                 └────────┬────────┘
//!                                          │ register before flush
//!                                          ▼
//!                                   transport flush
//!
//! transport read path ──▶ dispatch_reply(reply) ──▶ completion fires once
//! ```
//!
//! Write-class messages take a detour through [`WriteConcern`]: acknowledged
//! writes register under their piggybacked last-error command's id,
//! unacknowledged writes skip registration and synthesize results at flush.

pub mod completion;
pub mod table;
pub mod write_concern;

// Re-export commonly used types
pub use completion::{Completion, OpOutcome, ReplyFuture, WriteResult};
pub use table::{DispatchTable, PendingOp};
pub use write_concern::{AckOptions, WriteConcern};
