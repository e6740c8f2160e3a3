//! Driver Runtime and Connection
//!
//! [`Driver`] is the explicit runtime object everything shared hangs off:
//! the request-id counter, the dispatch table, the cursor reaper, and the
//! cleaning timer. Nothing in this crate is process-global, so multiple
//! independent drivers can coexist and tests stay deterministic.
//!
//! [`Connection`] composes a driver with one connection context and its
//! state tracker, and exposes the logical operations (query, insert, update,
//! delete, command) that funnel through the dispatch core. Submitting an
//! operation never blocks on a network round-trip: it transmits, defers, or
//! fails fast, and the outcome arrives through the operation's completion
//! handle.
//!
//! ## Send path
//!
//! ```text
//! caller
//!   │ send(message, completion)
//!   ▼
//! connected? ──no──▶ pending queue (FIFO, bounded)
//!   │ yes                  │
//!   ▼                      │ replayed on reconnect
//! read-class? ──▶ register in dispatch table, serialize, flush
//!   │
//! write-class ──▶ serialize write, resolve write concern:
//!                   acknowledged   → append last-error command to the same
//!                                    flush, register under its id
//!                   unacknowledged → flush, synthesize one success per id
//! ```

use crate::connection::context::{spawn_writer, ConnectionContext, DEFAULT_MAX_MESSAGE_SIZE};
use crate::connection::state::{ConnectionState, DeferOutcome, DeferredOp};
use crate::cursor::{CleaningTimer, CursorReaper};
use crate::dispatch::{Completion, DispatchTable, PendingOp, ReplyFuture, WriteConcern, WriteResult};
use crate::dispatch::completion::OpOutcome;
use crate::error::{DriverError, DriverResult};
use crate::protocol::{Document, Message, MessageHeader, Namespace, Reply, Value};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Upper bound accepted for an inbound reply frame (64 MB).
const MAX_REPLY_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for a [`Driver`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Period of the cursor cleaning task (default: 1s)
    pub clean_interval: Duration,

    /// Bound on each connection's pending queue while disconnected
    /// (default: 1024). Submissions past the bound fail their completion
    /// handle with [`DriverError::PendingQueueFull`].
    pub max_pending_ops: usize,

    /// Concern applied to writes that do not specify their own
    pub default_write_concern: WriteConcern,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            clean_interval: Duration::from_secs(1),
            max_pending_ops: 1024,
            default_write_concern: WriteConcern::default(),
        }
    }
}

/// The shared runtime: request ids, dispatch table, cursor reclamation.
#[derive(Debug)]
pub struct Driver {
    config: DriverConfig,
    request_ids: AtomicI32,
    dispatch: DispatchTable,
    reaper: CursorReaper,
    cleaner: CleaningTimer,
}

impl Driver {
    /// Creates a driver with the given configuration.
    pub fn new(config: DriverConfig) -> Arc<Self> {
        let cleaner = CleaningTimer::new(config.clean_interval);
        Arc::new(Self {
            config,
            request_ids: AtomicI32::new(1),
            dispatch: DispatchTable::new(),
            reaper: CursorReaper::new(),
            cleaner,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn reaper(&self) -> &CursorReaper {
        &self.reaper
    }

    pub fn cleaner(&self) -> &CleaningTimer {
        &self.cleaner
    }

    /// Allocates the next request id (monotonic per driver).
    pub fn next_request_id(&self) -> i32 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Routes a decoded reply to its pending operation.
    ///
    /// Called from the transport read path. Returns true if a pending entry
    /// matched; an unmatched reply is dropped with a diagnostic.
    pub fn handle_reply(&self, reply: Reply) -> bool {
        self.dispatch.dispatch_reply(reply)
    }

    /// Parses and routes a complete reply frame.
    pub fn handle_frame(&self, frame: &[u8]) -> DriverResult<bool> {
        let reply = Reply::parse(frame).map_err(|e| DriverError::Malformed(e.to_string()))?;
        Ok(self.handle_reply(reply))
    }

    /// One cursor-reclamation pass over every tracked context.
    ///
    /// Each non-empty queue is drained into a single kill-cursors message
    /// sent fire-and-forget on that context's connection; contexts whose
    /// queue is empty are removed from tracking. Invoked by the cleaning
    /// timer, and directly by tests.
    pub fn reap_pass(&self) {
        for context in self.reaper.tracked() {
            let Some(ids) = self.reaper.drain(context) else {
                continue;
            };
            match self.cleaner.lookup(context) {
                Some(conn) => {
                    debug!(context = %context, cursors = ids.len(), "reclaiming dead cursors");
                    let message = Message::kill_cursors(self.next_request_id(), ids);
                    conn.send(message, Completion::discard(), false);
                }
                None => {
                    // best-effort: without a live connection the ids are lost
                    warn!(
                        context = %context,
                        dropped = ids.len(),
                        "dead cursors lost: no live connection registered"
                    );
                }
            }
        }
        self.cleaner.prune_dead();
    }

    /// Dials a server over TCP, wires up the reader/writer tasks, and runs
    /// the handshake. The connection comes back connected, or not at all.
    pub async fn connect_tcp(
        self: &Arc<Self>,
        addr: &str,
        require_master: bool,
    ) -> DriverResult<Arc<Connection>> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let (context, outbound) = ConnectionContext::channel();
        let conn = Connection::new(self, context);

        spawn_writer(outbound, write_half);
        spawn_reader(Arc::downgrade(&conn), read_half);

        match conn.check_master(true, require_master).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.close();
                Err(e)
            }
        }
    }
}

/// One logical connection: a context, its state tracker, and the driver.
#[derive(Debug)]
pub struct Connection {
    driver: Arc<Driver>,
    context: ConnectionContext,
    state: ConnectionState,
}

impl Connection {
    /// Creates a connection and registers it with the cleaning timer.
    ///
    /// The connection starts disconnected; run [`connect`](Self::connect)
    /// (or [`check_master`](Self::check_master)) to bring it up.
    pub fn new(driver: &Arc<Driver>, context: ConnectionContext) -> Arc<Self> {
        let conn = Self::detached(driver, context);
        driver.cleaner().acquire(driver, &conn);
        conn
    }

    /// Creates a connection without registering it with the cleaning timer.
    ///
    /// For embedders that drive timer acquisition themselves.
    pub fn detached(driver: &Arc<Driver>, context: ConnectionContext) -> Arc<Self> {
        Arc::new(Self {
            driver: Arc::clone(driver),
            context,
            state: ConnectionState::new(),
        })
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Performs the initial handshake. Call once at construction.
    pub async fn connect(&self, require_master: bool) -> DriverResult<()> {
        self.check_master(true, require_master).await
    }

    /// Issues the handshake command unless already connected and `force` is
    /// false.
    ///
    /// On reply the context's `is_master` flag and maximum message size are
    /// updated from the response. If `require_master` and the server reports
    /// it is not master, the handshake fails and the connection stays
    /// disconnected; otherwise the connection transitions to connected,
    /// draining any operations deferred while it was down.
    pub async fn check_master(&self, force: bool, require_master: bool) -> DriverResult<()> {
        if self.state.is_connected() && !force {
            return Ok(());
        }

        let command = Document::new().with("ismaster", 1);
        let message = Message::command(self.driver.next_request_id(), "admin", command);
        let (completion, future) = Completion::channel();
        // the connection is not connected yet, so the liveness check is
        // overridden for the handshake itself
        self.send(message, completion, true);

        let reply = future.wait().await?.into_reply()?;
        let doc = reply
            .first_document()
            .ok_or_else(|| DriverError::Malformed("empty handshake reply".to_string()))?;

        let is_master = doc.bool_or("ismaster", false);
        let max_message_size = doc.i32_or("maxMessageSizeBytes", DEFAULT_MAX_MESSAGE_SIZE);
        self.context.apply_handshake(is_master, max_message_size);

        if require_master && !is_master {
            warn!(context = %self.context.id(), "handshake failed: server is not master");
            return Err(DriverError::NoMaster);
        }

        info!(
            context = %self.context.id(),
            is_master,
            max_message_size,
            "handshake complete"
        );
        self.set_connection_state(true);
        Ok(())
    }

    /// Idempotent connected/disconnected transition.
    ///
    /// On a false-to-true transition the pending queue is drained and each
    /// deferred operation executes in its original submission order, with
    /// the now-known maximum message size in force. Every other transition
    /// is bookkeeping only.
    pub fn set_connection_state(&self, connected: bool) {
        let drained = self.state.set_connected(connected);
        if drained.is_empty() {
            return;
        }
        info!(
            context = %self.context.id(),
            count = drained.len(),
            "replaying operations deferred while disconnected"
        );
        for op in drained {
            self.transmit_deferred(op);
        }
    }

    /// Submits a message with the driver's default write concern.
    ///
    /// Outcomes, including all failures, arrive through `completion`; this
    /// call never blocks on the network.
    pub fn send(&self, message: Message, completion: Completion, override_live_check: bool) {
        self.send_with_concern(message, None, completion, override_live_check);
    }

    /// Submits a read-class message, rejecting write-class shapes.
    pub fn send_read(&self, message: Message, completion: Completion) {
        if message.is_write() {
            completion.complete(Err(DriverError::ProtocolShape { op: "write-class" }));
            return;
        }
        self.send(message, completion, false);
    }

    /// Submits a write-class message under an explicit concern, rejecting
    /// read shapes.
    pub fn send_write(&self, message: Message, concern: WriteConcern, completion: Completion) {
        if !message.is_write() {
            completion.complete(Err(DriverError::ProtocolShape { op: "read-class" }));
            return;
        }
        self.send_with_concern(message, Some(concern), completion, false);
    }

    /// Full send path: defer, fail fast, or transmit.
    pub fn send_with_concern(
        &self,
        message: Message,
        concern: Option<WriteConcern>,
        completion: Completion,
        override_live_check: bool,
    ) {
        if !self.state.is_connected() && !override_live_check {
            let limit = self.driver.config().max_pending_ops;
            let op = DeferredOp {
                message,
                concern,
                completion,
            };
            match self.state.defer(op, limit) {
                DeferOutcome::Queued => {
                    debug!(
                        context = %self.context.id(),
                        pending = self.state.pending_len(),
                        "operation deferred until reconnect"
                    );
                }
                // the connection came up between the flag read and the
                // queue lock; execute as if it had been up all along
                DeferOutcome::Connected(op) => self.transmit_deferred(op),
                DeferOutcome::Full(op) => {
                    warn!(context = %self.context.id(), limit, "pending queue full");
                    op.completion
                        .complete(Err(DriverError::PendingQueueFull { limit }));
                }
            }
            return;
        }

        if !self.context.is_open() {
            completion.complete(Err(DriverError::ConnectionClosed));
            return;
        }

        let concern = concern.unwrap_or_else(|| self.driver.config().default_write_concern.clone());
        self.transmit(message, &concern, completion);
    }

    fn transmit_deferred(&self, op: DeferredOp) {
        if !self.context.is_open() {
            op.completion.complete(Err(DriverError::ConnectionClosed));
            return;
        }
        let concern = op
            .concern
            .unwrap_or_else(|| self.driver.config().default_write_concern.clone());
        self.transmit(op.message, &concern, op.completion);
    }

    /// Serializes and flushes one message, plus its acknowledgement command
    /// when the concern asks for one. The write and its follow-up share a
    /// single buffer and a single flush, so their bytes are never
    /// interleaved with another operation's.
    fn transmit(&self, message: Message, concern: &WriteConcern, completion: Completion) {
        let max = self.context.max_message_size();
        let mut buf = self.context.new_output_stream();

        if message.is_write() {
            message.serialize_into(&mut buf);
            if buf.len() > max as usize {
                completion.complete(Err(DriverError::MessageTooLarge {
                    size: buf.len(),
                    max,
                }));
                return;
            }

            let Some(database) = message.database() else {
                completion.complete(Err(DriverError::ProtocolShape { op: "write-class" }));
                return;
            };
            let database = database.to_string();
            let op_count = message.write_op_count();

            match concern.last_error_command(self.driver.next_request_id(), &database) {
                Some(ack) => {
                    let ack_id = ack.request_id();
                    self.driver
                        .dispatch()
                        .register(ack_id, PendingOp::write_ack(message, op_count, completion));
                    ack.serialize_into(&mut buf);
                    trace!(
                        context = %self.context.id(),
                        request_id = ack_id,
                        "acknowledged write flushed with last-error command"
                    );
                    if !self.context.write(buf.freeze()) {
                        if let Some(op) = self.driver.dispatch().remove(ack_id) {
                            op.fail(DriverError::ConnectionClosed);
                        }
                    }
                }
                None => {
                    if self.context.write(buf.freeze()) {
                        completion.complete(Ok(OpOutcome::Writes(vec![
                            WriteResult::synthetic();
                            op_count
                        ])));
                    } else {
                        completion.complete(Err(DriverError::ConnectionClosed));
                    }
                }
            }
        } else if message.expects_reply() {
            // register before serializing, so a reply racing the flush still
            // finds its entry
            let request_id = message.request_id();
            self.driver
                .dispatch()
                .register(request_id, PendingOp::read(message.clone(), completion));
            message.serialize_into(&mut buf);
            if buf.len() > max as usize {
                if let Some(op) = self.driver.dispatch().remove(request_id) {
                    op.fail(DriverError::MessageTooLarge {
                        size: buf.len(),
                        max,
                    });
                }
                return;
            }
            if !self.context.write(buf.freeze()) {
                if let Some(op) = self.driver.dispatch().remove(request_id) {
                    op.fail(DriverError::ConnectionClosed);
                }
            }
        } else {
            // no reply expected and not a write: flush and report sent
            message.serialize_into(&mut buf);
            if self.context.write(buf.freeze()) {
                completion.complete(Ok(OpOutcome::Sent));
            } else {
                completion.complete(Err(DriverError::ConnectionClosed));
            }
        }
    }

    // Logical operations. Thin composition over the send path: each builds
    // a message, allocates a request id, and returns the awaitable handle.

    /// Runs a query.
    pub fn query(
        &self,
        ns: Namespace,
        query: Document,
        fields: Option<Document>,
        skip: i32,
        limit: i32,
    ) -> ReplyFuture {
        let message = Message::query(
            self.driver.next_request_id(),
            ns,
            0,
            skip,
            limit,
            query,
            fields,
        );
        let (completion, future) = Completion::channel();
        self.send_read(message, completion);
        future
    }

    /// Fetches the next batch from an open cursor.
    pub fn get_more(&self, ns: Namespace, cursor_id: i64, limit: i32) -> ReplyFuture {
        let message = Message::get_more(self.driver.next_request_id(), ns, limit, cursor_id);
        let (completion, future) = Completion::channel();
        self.send_read(message, completion);
        future
    }

    /// Inserts documents under the given write concern.
    pub fn insert(
        &self,
        ns: Namespace,
        documents: Vec<Document>,
        concern: WriteConcern,
    ) -> ReplyFuture {
        let message = Message::insert(self.driver.next_request_id(), ns, documents);
        let (completion, future) = Completion::channel();
        self.send_write(message, concern, completion);
        future
    }

    /// Updates documents matching `selector`.
    pub fn update(
        &self,
        ns: Namespace,
        selector: Document,
        update: Document,
        flags: i32,
        concern: WriteConcern,
    ) -> ReplyFuture {
        let message = Message::update(self.driver.next_request_id(), ns, flags, selector, update);
        let (completion, future) = Completion::channel();
        self.send_write(message, concern, completion);
        future
    }

    /// Deletes documents matching `selector`.
    pub fn delete(
        &self,
        ns: Namespace,
        selector: Document,
        flags: i32,
        concern: WriteConcern,
    ) -> ReplyFuture {
        let message = Message::delete(self.driver.next_request_id(), ns, flags, selector);
        let (completion, future) = Completion::channel();
        self.send_write(message, concern, completion);
        future
    }

    /// Runs a database command.
    pub fn command(&self, database: &str, command: Document) -> ReplyFuture {
        let message = Message::command(self.driver.next_request_id(), database, command);
        let (completion, future) = Completion::channel();
        self.send_read(message, completion);
        future
    }

    /// Runs a command and returns its reply document, mapping a non-ok
    /// reply to an error.
    pub async fn run_command(&self, database: &str, command: Document) -> DriverResult<Document> {
        let reply = self.command(database, command).wait().await?.into_reply()?;
        let doc = reply
            .first_document()
            .ok_or_else(|| DriverError::Malformed("empty command reply".to_string()))?;
        if !doc.command_ok() {
            return Err(DriverError::CommandFailure {
                message: doc.str_or("errmsg", "unknown error").to_string(),
            });
        }
        Ok(doc.clone())
    }

    /// Atomically modifies one document and returns it.
    ///
    /// A reply with no matched document maps to [`DriverError::NotFound`],
    /// distinct from generic command failure.
    pub async fn find_and_modify(
        &self,
        ns: &Namespace,
        query: Document,
        update: Document,
        return_new: bool,
    ) -> DriverResult<Document> {
        let mut command = Document::new()
            .with("findandmodify", ns.collection.clone())
            .with("query", query)
            .with("update", update);
        if return_new {
            command.insert("new", true);
        }

        let reply = self
            .command(&ns.database, command)
            .wait()
            .await?
            .into_reply()?;
        let doc = reply
            .first_document()
            .ok_or_else(|| DriverError::Malformed("empty findandmodify reply".to_string()))?;

        if !doc.command_ok() {
            let message = doc.str_or("errmsg", "unknown error");
            if message.contains("No matching object found") {
                return Err(DriverError::NotFound);
            }
            return Err(DriverError::CommandFailure {
                message: message.to_string(),
            });
        }

        match doc.get("value") {
            Some(Value::Document(value)) => Ok(value.clone()),
            _ => Err(DriverError::NotFound),
        }
    }

    /// Sends a kill-cursors message immediately, fire-and-forget.
    pub fn kill_cursors(&self, cursor_ids: Vec<i64>) -> ReplyFuture {
        let message = Message::kill_cursors(self.driver.next_request_id(), cursor_ids);
        let (completion, future) = Completion::channel();
        self.send(message, completion, false);
        future
    }

    /// Queues cursors for deferred, batched reclamation by the cleaning
    /// timer. No network I/O happens here.
    pub fn mark_cursors_dead(&self, ids: impl IntoIterator<Item = i64>) {
        self.driver.reaper().mark_dead(self.context.id(), ids);
    }

    /// Closes the connection: deregisters from the cleaning timer, marks the
    /// state disconnected, and shuts the transport.
    pub fn close(&self) {
        self.driver.cleaner().stop(self.context.id());
        let dropped = self.driver.reaper().forget(self.context.id());
        if dropped > 0 {
            debug!(
                context = %self.context.id(),
                dropped,
                "discarding queued dead cursors on close"
            );
        }
        self.set_connection_state(false);
        self.context.close();
        info!(context = %self.context.id(), "connection closed");
    }
}

/// Reads reply frames from an async source and routes them through the
/// dispatch table. One reader task per connection; holds only a weak
/// connection handle so it cannot keep the connection alive.
///
/// On EOF or a transport error the connection is marked disconnected; its
/// pending dispatch entries stay unmatched, exactly as a reply that never
/// arrives would leave them.
pub fn spawn_reader<R>(conn: Weak<Connection>, mut source: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut header = [0u8; MessageHeader::LEN];
            if let Err(e) = source.read_exact(&mut header).await {
                debug!(error = %e, "reader stopped");
                break;
            }
            let total = match MessageHeader::parse(&header) {
                Ok(parsed) => parsed.message_length as usize,
                Err(e) => {
                    warn!(error = %e, "unreadable frame header");
                    break;
                }
            };
            if total < MessageHeader::LEN + 20 || total > MAX_REPLY_SIZE {
                warn!(length = total, "implausible frame length, stopping reader");
                break;
            }

            let mut frame = vec![0u8; total];
            frame[..MessageHeader::LEN].copy_from_slice(&header);
            if let Err(e) = source.read_exact(&mut frame[MessageHeader::LEN..]).await {
                debug!(error = %e, "reader stopped mid-frame");
                break;
            }

            let Some(conn) = conn.upgrade() else {
                return;
            };
            match conn.driver().handle_frame(&frame) {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "dropping malformed reply frame"),
            }
        }

        if let Some(conn) = conn.upgrade() {
            conn.set_connection_state(false);
        }
    })
}
