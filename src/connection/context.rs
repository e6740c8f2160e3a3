//! Connection Context
//!
//! The per-physical-connection transport seam. A context owns the outbound
//! byte channel, the transport-open flag, and the two fields the handshake
//! negotiates: the maximum message size and whether the server is master.
//!
//! Callers serialize messages into a buffer from [`new_output_stream`] and
//! hand the frozen bytes to [`write`], which enqueues them on an unbounded
//! channel. A writer task (or a test) drains the other end, so no caller
//! ever blocks on network I/O and no lock is held across a write.
//!
//! [`new_output_stream`]: ConnectionContext::new_output_stream
//! [`write`]: ConnectionContext::write

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum message size assumed before the handshake reports the real one.
pub const DEFAULT_MAX_MESSAGE_SIZE: i32 = 4 * 1024 * 1024;

/// Initial capacity for output buffers
const INITIAL_BUFFER_SIZE: usize = 4096;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection context.
///
/// Everything keyed by connection (dead-cursor queues, the cleaning-timer
/// registry) uses this id rather than the context itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Per-connection transport abstraction.
pub struct ConnectionContext {
    id: ContextId,

    /// Outbound frames; drained by a writer task or a test harness
    outbound: mpsc::UnboundedSender<Bytes>,

    /// Transport-level liveness; false after close or a failed write
    open: AtomicBool,

    /// Set only by the handshake path
    is_master: AtomicBool,

    /// Set only by the handshake path; positive
    max_message_size: AtomicI32,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("open", &self.open.load(Ordering::Relaxed))
            .field("is_master", &self.is_master.load(Ordering::Relaxed))
            .field(
                "max_message_size",
                &self.max_message_size.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl ConnectionContext {
    /// Creates a context and the receiving end of its outbound channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = Self {
            id: ContextId::next(),
            outbound: tx,
            open: AtomicBool::new(true),
            is_master: AtomicBool::new(false),
            max_message_size: AtomicI32::new(DEFAULT_MAX_MESSAGE_SIZE),
        };
        (context, rx)
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// A fresh output buffer to serialize one flush worth of messages into.
    pub fn new_output_stream(&self) -> BytesMut {
        BytesMut::with_capacity(INITIAL_BUFFER_SIZE)
    }

    /// Enqueues a serialized frame for transmission.
    ///
    /// Returns false if the transport is closed (including a writer that went
    /// away mid-session); the frame is dropped in that case.
    pub fn write(&self, frame: Bytes) -> bool {
        if frame.is_empty() || !self.is_open() {
            return false;
        }
        if self.outbound.send(frame).is_err() {
            warn!(context = %self.id, "outbound channel gone, marking context closed");
            self.open.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Closes the transport. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // empty frame is the writer task's stop sentinel
            let _ = self.outbound.send(Bytes::new());
            debug!(context = %self.id, "context closed");
        }
    }

    /// True while the transport accepts frames.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Whether the handshake reported the server as master.
    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::Acquire)
    }

    /// The negotiated maximum message size.
    pub fn max_message_size(&self) -> i32 {
        self.max_message_size.load(Ordering::Acquire)
    }

    /// Records the handshake result. This is the only mutation path for
    /// `is_master` and `max_message_size`.
    pub(crate) fn apply_handshake(&self, is_master: bool, max_message_size: i32) {
        self.is_master.store(is_master, Ordering::Release);
        if max_message_size > 0 {
            self.max_message_size
                .store(max_message_size, Ordering::Release);
        }
    }
}

/// Drains a context's outbound channel into an async sink.
///
/// Stops on the close sentinel, on channel teardown, or on the first write
/// error. One writer task per connection.
pub fn spawn_writer<W>(mut outbound: mpsc::UnboundedReceiver<Bytes>, mut sink: W) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if frame.is_empty() {
                break;
            }
            if let Err(e) = sink.write_all(&frame).await {
                warn!(error = %e, "transport write failed");
                break;
            }
            if let Err(e) = sink.flush().await {
                warn!(error = %e, "transport flush failed");
                break;
            }
        }
        debug!("writer task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let (a, _rx_a) = ConnectionContext::channel();
        let (b, _rx_b) = ConnectionContext::channel();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_write_reaches_receiver() {
        let (context, mut rx) = ConnectionContext::channel();
        let mut buf = context.new_output_stream();
        buf.extend_from_slice(b"frame");
        assert!(context.write(buf.freeze()));

        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame[..], b"frame");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_writes() {
        let (context, mut rx) = ConnectionContext::channel();
        context.close();
        context.close();
        assert!(!context.is_open());
        assert!(!context.write(Bytes::from_static(b"late")));

        // only the single close sentinel was queued
        assert_eq!(rx.recv().await.unwrap(), Bytes::new());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_handshake_fields() {
        let (context, _rx) = ConnectionContext::channel();
        assert!(!context.is_master());
        assert_eq!(context.max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);

        context.apply_handshake(true, 48_000_000);
        assert!(context.is_master());
        assert_eq!(context.max_message_size(), 48_000_000);

        // a non-positive size from a confused server is ignored
        context.apply_handshake(true, 0);
        assert_eq!(context.max_message_size(), 48_000_000);
    }

    #[tokio::test]
    async fn test_writer_task_drains_to_sink() {
        let (context, rx) = ConnectionContext::channel();
        let (client, mut server) = tokio::io::duplex(1024);
        let handle = spawn_writer(rx, client);

        context.write(Bytes::from_static(b"hello "));
        context.write(Bytes::from_static(b"world"));
        context.close();
        handle.await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
