//! Dead Cursor Queues
//!
//! When a client abandons a cursor before exhausting it, the server-side
//! resource must eventually be reclaimed. Marking a cursor dead is
//! fire-and-forget: the id lands in its connection's queue here and no
//! network I/O happens at call time. The cleaning timer later drains whole
//! queues and turns each into a single reclamation message.
//!
//! Queues are keyed by [`ContextId`] in a concurrent map, so markers on
//! different connections never contend.

use crate::connection::ContextId;
use dashmap::DashMap;
use tracing::trace;

/// Per-connection queues of cursor ids awaiting batched reclamation.
#[derive(Debug, Default)]
pub struct CursorReaper {
    queues: DashMap<ContextId, Vec<i64>>,
}

impl CursorReaper {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Appends cursor ids to the context's dead-cursor queue.
    ///
    /// Starts tracking the context if it was not tracked before.
    pub fn mark_dead(&self, context: ContextId, ids: impl IntoIterator<Item = i64>) {
        let mut queue = self.queues.entry(context).or_default();
        let before = queue.len();
        queue.extend(ids);
        trace!(
            context = %context,
            added = queue.len() - before,
            queued = queue.len(),
            "cursors marked dead"
        );
    }

    /// Contexts currently tracked, including those with empty queues.
    pub fn tracked(&self) -> Vec<ContextId> {
        self.queues.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_tracking(&self, context: ContextId) -> bool {
        self.queues.contains_key(&context)
    }

    /// Atomically drains the context's queue for one cleanup pass.
    ///
    /// Returns `Some(ids)` when ids were queued; the context stays tracked
    /// with an empty queue. Returns `None` when the queue was already empty,
    /// in which case the context is removed from tracking entirely
    /// (self-pruning), or was never tracked.
    pub fn drain(&self, context: ContextId) -> Option<Vec<i64>> {
        let drained = self
            .queues
            .get_mut(&context)
            .map(|mut queue| std::mem::take(&mut *queue));
        match drained {
            None => None,
            Some(ids) if ids.is_empty() => {
                // re-check under the entry lock: a concurrent mark may have
                // refilled the queue between the take and this removal
                self.queues.remove_if(&context, |_, queue| queue.is_empty());
                None
            }
            Some(ids) => Some(ids),
        }
    }

    /// Drops a context's queue without sending anything.
    pub fn forget(&self, context: ContextId) -> usize {
        self.queues
            .remove(&context)
            .map(|(_, ids)| ids.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionContext;

    fn context_id() -> ContextId {
        let (context, _rx) = ConnectionContext::channel();
        context.id()
    }

    #[test]
    fn test_mark_appends_in_order() {
        let reaper = CursorReaper::new();
        let ctx = context_id();

        reaper.mark_dead(ctx, [5]);
        reaper.mark_dead(ctx, [6, 7]);

        assert!(reaper.is_tracking(ctx));
        assert_eq!(reaper.drain(ctx), Some(vec![5, 6, 7]));
    }

    #[test]
    fn test_drain_then_empty_pass_self_prunes() {
        let reaper = CursorReaper::new();
        let ctx = context_id();
        reaper.mark_dead(ctx, [5, 6, 7]);

        // first pass drains everything but keeps the context tracked
        assert_eq!(reaper.drain(ctx), Some(vec![5, 6, 7]));
        assert!(reaper.is_tracking(ctx));

        // second pass finds the queue empty and removes the context
        assert_eq!(reaper.drain(ctx), None);
        assert!(!reaper.is_tracking(ctx));
    }

    #[test]
    fn test_drain_untracked_context() {
        let reaper = CursorReaper::new();
        assert_eq!(reaper.drain(context_id()), None);
    }

    #[test]
    fn test_queues_are_per_context() {
        let reaper = CursorReaper::new();
        let (a, b) = (context_id(), context_id());
        reaper.mark_dead(a, [1]);
        reaper.mark_dead(b, [2]);

        assert_eq!(reaper.drain(a), Some(vec![1]));
        assert_eq!(reaper.drain(b), Some(vec![2]));
    }

    #[test]
    fn test_forget_discards_queue() {
        let reaper = CursorReaper::new();
        let ctx = context_id();
        reaper.mark_dead(ctx, [1, 2]);
        assert_eq!(reaper.forget(ctx), 2);
        assert!(!reaper.is_tracking(ctx));
        assert_eq!(reaper.forget(ctx), 0);
    }
}
