//! Cleaning Timer
//!
//! A reference-counted periodic task that drives cursor reclamation. The
//! timer owns a registry of live connections; registering the first
//! connection starts the background task and deregistering the last one
//! stops it:
//!
//! ```text
//!            registry empty → non-empty
//!  INACTIVE ────────────────────────────▶ ACTIVE
//!     ▲                                     │
//!     └──────── non-empty → empty ──────────┘
//! ```
//!
//! The registry holds `Weak` references and never keeps a connection alive;
//! the owning caller controls the connection's real lifetime and is expected
//! to call [`CleaningTimer::stop`] on close. A connection dropped without
//! `stop` is pruned on the next pass and any cursors still queued for it are
//! lost. Reclamation is best-effort, not transactional.
//!
//! `acquire` and `stop` are safe under any interleaving, including double
//! stops and stops without a matching acquire.

use crate::connection::pool::{Connection, Driver};
use crate::connection::ContextId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reference-counted driver of the periodic cursor cleanup task.
#[derive(Debug)]
pub struct CleaningTimer {
    interval: Duration,
    inner: Mutex<TimerInner>,
}

#[derive(Debug)]
struct TimerInner {
    registry: HashMap<ContextId, Weak<Connection>>,
    task: Option<TimerTask>,
}

#[derive(Debug)]
struct TimerTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleaningTimer {
    /// A timer in the inactive state; nothing is spawned until the first
    /// [`acquire`](Self::acquire).
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(TimerInner {
                registry: HashMap::new(),
                task: None,
            }),
        }
    }

    /// Registers a connection with the cleanup task.
    ///
    /// Starts the periodic task when the registry transitions from empty to
    /// non-empty; otherwise this is pure bookkeeping. Re-acquiring an
    /// already-registered connection is a no-op.
    pub fn acquire(&self, driver: &Arc<Driver>, conn: &Arc<Connection>) {
        let mut inner = self.inner.lock().unwrap();
        let was_empty = inner.registry.is_empty();
        inner
            .registry
            .insert(conn.context().id(), Arc::downgrade(conn));

        if was_empty && inner.task.is_none() {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(clean_loop(
                Arc::downgrade(driver),
                self.interval,
                shutdown_rx,
            ));
            inner.task = Some(TimerTask {
                shutdown_tx,
                handle,
            });
            info!("cursor cleaning timer started");
        }
    }

    /// Deregisters a connection.
    ///
    /// Stops and discards the periodic task when the registry empties.
    /// Double stops and stops without a matching acquire are no-ops.
    pub fn stop(&self, context: ContextId) {
        let mut inner = self.inner.lock().unwrap();
        inner.registry.remove(&context);
        halt_if_idle(&mut inner);
    }

    /// True while the periodic task is running.
    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().task.is_some()
    }

    /// Number of registered connections.
    pub fn registered_len(&self) -> usize {
        self.inner.lock().unwrap().registry.len()
    }

    /// Looks up the live connection for a context, if registered and alive.
    pub fn lookup(&self, context: ContextId) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().unwrap();
        inner.registry.get(&context).and_then(Weak::upgrade)
    }

    /// Removes registry entries whose connection was dropped without a stop,
    /// going inactive if that empties the registry.
    pub fn prune_dead(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.registry.retain(|context, weak| {
            let alive = weak.strong_count() > 0;
            if !alive {
                warn!(context = %context, "connection dropped without stop; pruning from registry");
            }
            alive
        });
        halt_if_idle(&mut inner);
    }
}

/// Shuts the periodic task down once the registry is empty.
fn halt_if_idle(inner: &mut TimerInner) {
    if !inner.registry.is_empty() {
        return;
    }
    if let Some(task) = inner.task.take() {
        let _ = task.shutdown_tx.send(true);
        drop(task.handle);
        info!("cursor cleaning timer stopped");
    }
}

/// The periodic loop: sleep, wake, run one cleanup pass.
///
/// Holds only a weak driver handle so an abandoned driver tears the loop
/// down instead of being kept alive by it.
async fn clean_loop(
    driver: Weak<Driver>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("cleaning timer received shutdown signal");
                    return;
                }
            }
        }

        let Some(driver) = driver.upgrade() else {
            return;
        };
        driver.reap_pass();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::pool::DriverConfig;
    use crate::connection::ConnectionContext;

    fn test_driver() -> Arc<Driver> {
        Driver::new(DriverConfig {
            clean_interval: Duration::from_millis(10),
            ..Default::default()
        })
    }

    fn test_connection(driver: &Arc<Driver>) -> Arc<Connection> {
        let (context, _rx) = ConnectionContext::channel();
        Connection::detached(driver, context)
    }

    #[tokio::test]
    async fn test_acquire_is_reference_counted() {
        let driver = test_driver();
        let timer = CleaningTimer::new(Duration::from_millis(10));
        assert!(!timer.is_active());

        let conns: Vec<_> = (0..3).map(|_| test_connection(&driver)).collect();
        for conn in &conns {
            timer.acquire(&driver, conn);
        }
        assert!(timer.is_active());
        assert_eq!(timer.registered_len(), 3);

        // stopping all but the last keeps the task running
        timer.stop(conns[0].context().id());
        timer.stop(conns[1].context().id());
        assert!(timer.is_active());

        // the last stop halts it
        timer.stop(conns[2].context().id());
        assert!(!timer.is_active());
    }

    #[tokio::test]
    async fn test_mismatched_stop_is_a_no_op() {
        let driver = test_driver();
        let timer = CleaningTimer::new(Duration::from_millis(10));
        let conn = test_connection(&driver);

        // stop without acquire
        timer.stop(conn.context().id());
        assert!(!timer.is_active());

        timer.acquire(&driver, &conn);
        timer.stop(conn.context().id());
        timer.stop(conn.context().id()); // double stop
        assert!(!timer.is_active());

        // the timer still works after the mismatch
        timer.acquire(&driver, &conn);
        assert!(timer.is_active());
        timer.stop(conn.context().id());
    }

    #[tokio::test]
    async fn test_reacquire_same_connection_starts_one_task() {
        let driver = test_driver();
        let timer = CleaningTimer::new(Duration::from_millis(10));
        let conn = test_connection(&driver);

        timer.acquire(&driver, &conn);
        timer.acquire(&driver, &conn);
        assert_eq!(timer.registered_len(), 1);
        assert!(timer.is_active());

        // one stop is enough, since it is the same registration
        timer.stop(conn.context().id());
        assert!(!timer.is_active());
    }

    #[tokio::test]
    async fn test_prune_dead_drops_unstopped_connections() {
        let driver = test_driver();
        let timer = CleaningTimer::new(Duration::from_millis(10));
        let conn = test_connection(&driver);
        let ctx = conn.context().id();

        timer.acquire(&driver, &conn);
        drop(conn); // owner walked away without stop

        assert!(timer.lookup(ctx).is_none());
        timer.prune_dead();
        assert_eq!(timer.registered_len(), 0);
        // pruning the last entry also halts the task
        assert!(!timer.is_active());
    }
}
