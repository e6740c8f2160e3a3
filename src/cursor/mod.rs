//! Cursor Lifecycle Module
//!
//! Abandoned server-side cursors are reclaimed in two steps: marking a
//! cursor dead appends its id to a per-connection queue ([`CursorReaper`]),
//! and a reference-counted periodic task ([`CleaningTimer`]) later drains
//! each queue into a single batched reclamation message.
//!
//! Neither step blocks a caller on network I/O, and reclamation is
//! explicitly best-effort: see the module docs of [`timer`].

pub mod reaper;
pub mod timer;

// Re-export commonly used types
pub use reaper::CursorReaper;
pub use timer::CleaningTimer;
