//! Connection Module
//!
//! Everything per-connection lives here: the transport context, the
//! connected/disconnected state tracker with its pending queue, and the
//! [`Connection`]/[`Driver`] pair that composes the dispatch core into a
//! usable client.
//!
//! ## Connection lifecycle
//!
//! ```text
//! 1. ConnectionContext created (transport channel wired up)
//!        │
//!        ▼
//! 2. Connection::new  ──▶ registered with the cleaning timer
//!        │
//!        ▼
//! 3. connect() ──▶ handshake command ──▶ reply updates is_master and
//!        │                               max message size
//!        ▼
//! 4. CONNECTED: pending queue drained FIFO, operations flow directly
//!        │
//!        ▼
//! 5. close() / transport loss ──▶ DISCONNECTED, new submissions defer
//! ```

pub mod context;
pub mod pool;
pub mod state;

// Re-export commonly used types
pub use context::{spawn_writer, ConnectionContext, ContextId, DEFAULT_MAX_MESSAGE_SIZE};
pub use pool::{spawn_reader, Connection, Driver, DriverConfig};
pub use state::{ConnectionState, DeferOutcome, DeferredOp};
