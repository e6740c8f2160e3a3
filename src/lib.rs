//! # docwire - An Asynchronous Document-Database Driver Core
//!
//! docwire is the dispatch/lifecycle core of a client driver for a
//! document-database wire protocol. It manages duplex connections,
//! serializes outgoing operations, correlates asynchronous server replies to
//! the pending request that produced them, enforces write-acknowledgement
//! semantics, and reclaims abandoned server-side cursors in the background.
//!
//! ## Features
//!
//! - **Non-blocking sends**: submitting an operation transmits, defers, or
//!   fails fast; outcomes arrive through a single-fulfillment completion
//!   handle, never by blocking the caller on a round-trip
//! - **Reply correlation**: a concurrent dispatch table keyed by request id
//!   matches each inbound reply to exactly one completion
//! - **Write concerns**: acknowledged writes piggyback a last-error command
//!   on the same flush; unacknowledged writes synthesize immediate results
//! - **Deferred operations**: submissions while disconnected queue FIFO (with
//!   a configurable bound) and replay in order on reconnect
//! - **Cursor reclamation**: a reference-counted background task batches
//!   abandoned cursor ids into one kill-cursors message per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              Driver                                │
//! │                                                                    │
//! │  ┌──────────────┐   ┌───────────────┐   ┌──────────────────────┐   │
//! │  │  request-id  │   │ DispatchTable │   │ CursorReaper         │   │
//! │  │   counter    │   │ id → pending  │   │ ctx → dead cursors   │   │
//! │  └──────────────┘   └───────┬───────┘   └──────────┬───────────┘   │
//! │                             │                      │               │
//! │                             │            ┌─────────┴───────────┐   │
//! │                             │            │   CleaningTimer     │   │
//! │                             │            │ (background task)   │   │
//! │                             │            └─────────────────────┘   │
//! └─────────────────────────────┼──────────────────────────────────────┘
//!                               │
//!        ┌──────────────────────┴────────────────────┐
//!        │                Connection                 │
//!        │                                           │
//!        │  ┌─────────────────┐  ┌────────────────┐  │
//!        │  │ ConnectionState │  │ Connection     │  │
//!        │  │ + pending queue │  │ Context        │  │
//!        │  └─────────────────┘  └───────┬────────┘  │
//!        └──────────────────────────────┬┴───────────┘
//!                                       │ outbound frames
//!                            writer task ▼ / reader task ▲ replies
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use docwire::connection::{Driver, DriverConfig};
//! use docwire::dispatch::WriteConcern;
//! use docwire::protocol::{Document, Namespace};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), docwire::DriverError> {
//!     let driver = Driver::new(DriverConfig::default());
//!     let conn = driver.connect_tcp("127.0.0.1:27017", true).await?;
//!
//!     let ns = Namespace::new("app", "things");
//!     let writes = conn
//!         .insert(
//!             ns.clone(),
//!             vec![Document::new().with("name", "widget")],
//!             WriteConcern::acknowledged(),
//!         )
//!         .wait()
//!         .await?
//!         .into_writes()?;
//!     assert!(writes[0].acknowledged);
//!
//!     let reply = conn
//!         .query(ns, Document::new(), None, 0, 10)
//!         .wait()
//!         .await?
//!         .into_reply()?;
//!     println!("{} documents", reply.documents.len());
//!
//!     conn.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: documents, request messages, and reply frames
//! - [`dispatch`]: completion handles, the dispatch table, write concerns
//! - [`connection`]: transport context, state tracking, the driver runtime
//! - [`cursor`]: dead-cursor queues and the cleaning timer
//!
//! ## What This Core Does Not Do
//!
//! Authentication, replica-set topology discovery, cross-host multiplexing,
//! and operation timeouts are all out of scope. A reply that never arrives
//! leaves its completion handle unfired; callers needing deadlines supply
//! their own watchdog around [`dispatch::ReplyFuture::wait`].

pub mod connection;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod protocol;

// Re-export commonly used types for convenience
pub use connection::{Connection, ConnectionContext, ContextId, Driver, DriverConfig};
pub use cursor::{CleaningTimer, CursorReaper};
pub use dispatch::{Completion, OpOutcome, ReplyFuture, WriteConcern, WriteResult};
pub use error::{DriverError, DriverResult};
pub use protocol::{Document, Message, Namespace, Reply, Value};

/// The default port document-database servers listen on
pub const DEFAULT_PORT: u16 = 27017;

/// Version of docwire
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
