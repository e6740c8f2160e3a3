//! Write Concern and the Acknowledgement Piggyback
//!
//! The wire protocol gives writes no native reply. To learn a write's fate,
//! the driver follows it, on the same connection and in the same flush, with
//! a synchronous "last error" command; in-order delivery ties the command's
//! reply back to the write that preceded it.
//!
//! The concern decides what happens:
//!
//! | Concern | Behavior |
//! |---|---|
//! | `Unacknowledged` | No follow-up. The handle fires right after flush with one synthetic success per generated id. |
//! | `Acknowledged` (default) | A last-error command on the write's database joins the same flush. Its request id keys the dispatch table; the stored payload is the original write and its handle. |
//!
//! Either way there is exactly one dispatch-table entry per logical write.

use crate::protocol::{Document, Message};
use std::time::Duration;

/// Options for an acknowledged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOptions {
    /// Number of servers that must confirm the write (1 = master only)
    pub w: i32,

    /// Require the write to reach the journal first
    pub journal: bool,

    /// Require an fsync before confirming
    pub fsync: bool,

    /// How long the server may wait for `w` confirmations
    pub wtimeout: Option<Duration>,
}

impl Default for AckOptions {
    fn default() -> Self {
        Self {
            w: 1,
            journal: false,
            fsync: false,
            wtimeout: None,
        }
    }
}

/// Policy governing how strongly a write must be confirmed before its
/// completion handle fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteConcern {
    /// Fire-and-forget: completion fires once the bytes are flushed
    Unacknowledged,
    /// Confirm through a piggybacked last-error command
    Acknowledged(AckOptions),
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::Acknowledged(AckOptions::default())
    }
}

impl WriteConcern {
    /// The default acknowledged concern (`w = 1`).
    pub fn acknowledged() -> Self {
        Self::default()
    }

    /// No confirmation at all.
    pub fn unacknowledged() -> Self {
        WriteConcern::Unacknowledged
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(self, WriteConcern::Acknowledged(_))
    }

    /// Builds the last-error command that follows an acknowledged write on
    /// `database`, or `None` when no confirmation is requested.
    ///
    /// The command key comes first in the document; servers read the command
    /// name from the first key.
    pub fn last_error_command(&self, request_id: i32, database: &str) -> Option<Message> {
        let opts = match self {
            WriteConcern::Unacknowledged => return None,
            WriteConcern::Acknowledged(opts) => opts,
        };

        let mut cmd = Document::new().with("getlasterror", 1);
        if opts.w > 1 {
            cmd.insert("w", opts.w);
        }
        if opts.journal {
            cmd.insert("j", true);
        }
        if opts.fsync {
            cmd.insert("fsync", true);
        }
        if let Some(timeout) = opts.wtimeout {
            cmd.insert("wtimeout", timeout.as_millis() as i64);
        }

        Some(Message::command(request_id, database, cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageBody;

    #[test]
    fn test_default_is_acknowledged() {
        assert!(WriteConcern::default().is_acknowledged());
        assert_eq!(
            WriteConcern::default(),
            WriteConcern::Acknowledged(AckOptions::default())
        );
    }

    #[test]
    fn test_unacknowledged_has_no_follow_up() {
        assert!(WriteConcern::unacknowledged()
            .last_error_command(1, "db")
            .is_none());
    }

    #[test]
    fn test_plain_acknowledged_command() {
        let cmd = WriteConcern::acknowledged()
            .last_error_command(42, "app")
            .unwrap();
        assert_eq!(cmd.request_id(), 42);
        assert_eq!(cmd.database(), Some("app"));

        let MessageBody::Query { ns, query, .. } = cmd.body() else {
            panic!("last-error command must be a query");
        };
        assert_eq!(ns.full(), "app.$cmd");
        assert_eq!(query.get_i32("getlasterror"), Some(1));
        // no options requested, none embedded
        assert_eq!(query.len(), 1);
    }

    #[test]
    fn test_options_are_embedded() {
        let concern = WriteConcern::Acknowledged(AckOptions {
            w: 3,
            journal: true,
            fsync: true,
            wtimeout: Some(Duration::from_millis(250)),
        });
        let cmd = concern.last_error_command(1, "app").unwrap();
        let MessageBody::Query { query, .. } = cmd.body() else {
            panic!("last-error command must be a query");
        };

        // command key stays first
        assert_eq!(query.iter().next().unwrap().0, "getlasterror");
        assert_eq!(query.get_i32("w"), Some(3));
        assert_eq!(query.get_bool("j"), Some(true));
        assert_eq!(query.get_bool("fsync"), Some(true));
        assert_eq!(query.get_i64("wtimeout"), Some(250));
    }
}
