//! # TCP Client Transport
//!
//! The client side of a PVA virtual circuit. One transport is shared by
//! every channel targeting the same (remote address, priority) pair and is
//! reference-counted by its owning channels: the last owner to release the
//! transport closes it.
//!
//! ## Task model
//!
//! Three tokio tasks cooperate per connection:
//!
//! - **Receive task**: reads socket bytes into the frame decoder, services
//!   the control sub-protocol inline and hands complete application
//!   messages to the response dispatcher. Any parse failure closes the
//!   transport; errors never propagate out of the task.
//! - **Send task**: drains the FIFO send queue; each queued sender gets
//!   exclusive access to the message writer, then the accumulated frames
//!   are flushed to the socket in full.
//! - **Heartbeat task**: fires every beacon period, emitting an echo
//!   control message and checking liveness. A silent peer past the
//!   connection timeout marks the transport unresponsive and raises a
//!   synthetic disconnect to every owner; traffic resuming flips it back.
//!
//! ## Verification handshake
//!
//! After the socket opens, the server sends a connection-validation
//! request (available auth plugins plus its receive-buffer size); the
//! client answers selecting the anonymous plugin, and the server confirms
//! with a connection-validated status. Channel-creation traffic only flows
//! on a verified transport, which `connect` enforces by waiting for the
//! handshake to finish.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

use crate::channel::ChannelImpl;
use crate::dispatcher::{self, Origin};
use crate::error::{ClientError, Result};
use crate::introspection::IntrospectionRegistry;
use crate::ops::ResponseRequest;
use crate::provider::ContextInner;
use crate::pvdata::FieldDesc;
use crate::transport::codec::{DecodedMessage, MessageDecoder, MessageWriter};
use crate::transport::{SendFn, SendItem};
use crate::wire::{cmd, ctrl, ByteBuf, Status, PROTOCOL_REVISION};

/// Size of the framed send buffer; messages larger than this are
/// segmented.
pub const SEND_BUFFER_SIZE: usize = 32 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Authentication plugin selected during verification.
const AUTHZ_ANONYMOUS: &str = "anonymous";

/// Client side of one PVA virtual circuit.
pub struct TcpTransport {
    remote: SocketAddr,
    priority: u16,
    context: Weak<ContextInner>,
    weak_self: Weak<TcpTransport>,

    send_tx: mpsc::UnboundedSender<SendItem>,
    close_notify: Arc<Notify>,
    closed: AtomicBool,
    disconnect_posted: AtomicBool,

    verified_tx: watch::Sender<Option<Status>>,
    verified_rx: watch::Receiver<Option<Status>>,

    /// Owning channels, held weakly, keyed by CID.
    owners: Mutex<HashMap<u32, Weak<ChannelImpl>>>,

    /// In-flight operations keyed by IOID.
    requests: Mutex<HashMap<u32, Weak<dyn ResponseRequest>>>,
    next_ioid: AtomicU32,

    incoming_ir: Mutex<IntrospectionRegistry>,
    outgoing_ir: Mutex<IntrospectionRegistry>,

    last_alive: Mutex<Instant>,
    responsive: AtomicBool,
    remote_buffer_size: AtomicUsize,
}

impl TcpTransport {
    /// Establish a verified virtual circuit to `remote`.
    ///
    /// Spawns the receive/send/heartbeat tasks and waits for the
    /// verification handshake; an unverified connection is closed and
    /// reported as an error.
    pub(crate) async fn connect(
        context: &Arc<ContextInner>,
        remote: SocketAddr,
        priority: u16,
    ) -> Result<Arc<TcpTransport>> {
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (verified_tx, verified_rx) = watch::channel(None);
        let transport = Arc::new_cyclic(|weak_self| TcpTransport {
            remote,
            priority,
            context: Arc::downgrade(context),
            weak_self: weak_self.clone(),
            send_tx,
            close_notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            disconnect_posted: AtomicBool::new(false),
            verified_tx,
            verified_rx,
            owners: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            next_ioid: AtomicU32::new(1),
            incoming_ir: Mutex::new(IntrospectionRegistry::new()),
            outgoing_ir: Mutex::new(IntrospectionRegistry::new()),
            last_alive: Mutex::new(Instant::now()),
            responsive: AtomicBool::new(true),
            remote_buffer_size: AtomicUsize::new(SEND_BUFFER_SIZE),
        });
        debug!(%remote, priority, "tcp transport connecting");

        let max_payload = context.config.max_array_bytes;
        context
            .handle
            .spawn(Self::receive_task(transport.clone(), read_half, max_payload));
        context
            .handle
            .spawn(Self::send_task(transport.clone(), send_rx, write_half));
        context
            .handle
            .spawn(Self::heartbeat_task(transport.clone()));

        match transport
            .wait_verified(context.config.connection_timeout)
            .await
        {
            Ok(()) => Ok(transport),
            Err(e) => {
                transport.close(Some(&e));
                Err(e)
            }
        }
    }

    /// A strong handle to ourselves; `None` only mid-teardown.
    fn arc(&self) -> Option<Arc<TcpTransport>> {
        self.weak_self.upgrade()
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_verified(&self) -> bool {
        matches!(*self.verified_rx.borrow(), Some(ref s) if s.is_ok())
    }

    /// Queue a sender for the send task. A closed transport refuses the
    /// send outright.
    pub(crate) fn enqueue(&self, sender: SendFn) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        self.send_tx
            .send(SendItem::Message(sender))
            .map_err(|_| ClientError::ConnectionClosed)
    }

    // ---- owner tracking -------------------------------------------------

    /// Register a channel as an owner of this transport.
    pub(crate) fn register_owner(&self, cid: u32, channel: &Arc<ChannelImpl>) {
        self.owners.lock().insert(cid, Arc::downgrade(channel));
    }

    /// Release a channel's ownership; the last release closes the circuit.
    pub(crate) fn unregister_owner(&self, cid: u32) {
        let empty = {
            let mut owners = self.owners.lock();
            owners.remove(&cid);
            owners.is_empty()
        };
        if empty {
            debug!(remote = %self.remote, "last owner released, closing transport");
            self.close(None);
        }
    }

    fn snapshot_owners(&self) -> Vec<Arc<ChannelImpl>> {
        self.owners
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    // ---- in-flight requests ---------------------------------------------

    /// Allocate a fresh IOID and register the operation under it.
    pub(crate) fn register_request(&self, request: Weak<dyn ResponseRequest>) -> u32 {
        let ioid = self.next_ioid.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().insert(ioid, request);
        ioid
    }

    pub(crate) fn unregister_request(&self, ioid: u32) {
        self.requests.lock().remove(&ioid);
    }

    pub(crate) fn lookup_request(&self, ioid: u32) -> Option<Arc<dyn ResponseRequest>> {
        self.requests.lock().get(&ioid).and_then(Weak::upgrade)
    }

    // ---- introspection caches -------------------------------------------

    /// Serialize a descriptor through the outgoing cache.
    pub(crate) fn serialize_field(&self, desc: &FieldDesc, buf: &mut ByteBuf) {
        self.outgoing_ir.lock().serialize(desc, buf);
    }

    /// Deserialize a descriptor reference through the incoming cache.
    pub(crate) fn deserialize_field(&self, buf: &mut ByteBuf) -> Result<Option<FieldDesc>> {
        self.incoming_ir.lock().deserialize(buf)
    }

    // ---- liveness --------------------------------------------------------

    fn mark_alive(&self) {
        *self.last_alive.lock() = Instant::now();
        if !self.responsive.swap(true, Ordering::AcqRel) {
            debug!(remote = %self.remote, "transport responsive again");
            let Some(this) = self.arc() else { return };
            for channel in self.snapshot_owners() {
                channel.transport_responsive(&this);
            }
        }
    }

    fn check_responsiveness(&self, timeout: Duration) {
        let idle = self.last_alive.lock().elapsed();
        if idle > timeout && self.responsive.swap(false, Ordering::AcqRel) {
            warn!(remote = %self.remote, idle_secs = idle.as_secs(),
                  "transport unresponsive");
            for channel in self.snapshot_owners() {
                channel.transport_unresponsive();
            }
        }
    }

    // ---- verification ----------------------------------------------------

    async fn wait_verified(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.verified_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = rx.borrow().clone() {
                return status.to_result();
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
                Err(_) => return Err(ClientError::Timeout),
            }
        }
    }

    /// Server's validation request: record its receive window and answer
    /// with ours plus the selected auth plugin.
    pub(crate) fn handle_validation_request(
        &self,
        server_buffer_size: usize,
        plugins: Vec<String>,
    ) -> Result<()> {
        self.remote_buffer_size
            .store(server_buffer_size, Ordering::Relaxed);
        if !plugins.is_empty() && !plugins.iter().any(|p| p == AUTHZ_ANONYMOUS) {
            // No plugin we speak; answer anonymous anyway and let the
            // server decide whether to fail the validation.
            warn!(remote = %self.remote, ?plugins, "server offers no anonymous auth");
        }
        let max_payload = self
            .context
            .upgrade()
            .map(|c| c.config.max_array_bytes)
            .unwrap_or(SEND_BUFFER_SIZE);
        let priority = self.priority;
        self.enqueue(Box::new(move |writer: &mut MessageWriter| {
            writer.start_message(cmd::CONNECTION_VALIDATION)?;
            let buf = writer.payload();
            buf.put_u32(max_payload as u32);
            buf.put_u16(0x7FFF); // introspection registry capacity
            buf.put_u16(priority);
            buf.put_string(AUTHZ_ANONYMOUS);
            writer.end_message()
        }))
    }

    /// Server's verdict on the handshake.
    pub(crate) fn set_verified(&self, status: Status) {
        if !status.is_ok() {
            warn!(remote = %self.remote, message = status.message(),
                  "connection validation failed");
        }
        let _ = self.verified_tx.send(Some(status));
    }

    // ---- shutdown --------------------------------------------------------

    /// Close the circuit. Idempotent; posts exactly one synthetic
    /// disconnect to every owner and drops all in-flight registrations.
    pub(crate) fn close(&self, reason: Option<&ClientError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match reason {
            Some(e) => debug!(remote = %self.remote, error = %e, "closing transport"),
            None => debug!(remote = %self.remote, "closing transport"),
        }
        let _ = self.send_tx.send(SendItem::Shutdown);
        self.close_notify.notify_waiters();
        // Wake anyone still blocked on verification.
        let _ = self
            .verified_tx
            .send(Some(Status::Error("connection closed".into())));

        if let Some(this) = self.arc() {
            if let Some(context) = self.context.upgrade() {
                context.forget_transport(&this);
            }
            if !self.disconnect_posted.swap(true, Ordering::AcqRel) {
                for channel in self.snapshot_owners() {
                    channel.transport_closed(&this);
                }
            }
        }
        self.requests.lock().clear();
        self.owners.lock().clear();
    }

    // ---- tasks -----------------------------------------------------------

    async fn receive_task(
        transport: Arc<TcpTransport>,
        mut read_half: OwnedReadHalf,
        max_payload: usize,
    ) {
        let mut decoder = MessageDecoder::new(max_payload);
        let mut chunk = vec![0u8; READ_CHUNK];
        let close_notify = transport.close_notify.clone();
        loop {
            let n = tokio::select! {
                _ = close_notify.notified() => break,
                r = read_half.read(&mut chunk) => match r {
                    Ok(0) => {
                        transport.close(Some(&ClientError::ConnectionClosed));
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        transport.close(Some(&ClientError::Io(e)));
                        break;
                    }
                },
            };
            transport.mark_alive();
            decoder.push(&chunk[..n]);
            loop {
                match decoder.next() {
                    Ok(Some(msg)) => transport.handle_message(msg),
                    Ok(None) => break,
                    Err(e) => {
                        // Unparseable stream: close and let the channels
                        // re-enter their connecting state.
                        transport.close(Some(&e));
                        return;
                    }
                }
            }
            if transport.is_closed() {
                break;
            }
        }
        trace!(remote = %transport.remote, "receive task finished");
    }

    fn handle_message(&self, msg: DecodedMessage) {
        match msg {
            DecodedMessage::Echo => {}
            DecodedMessage::ByteOrderChanged(order) => {
                trace!(remote = %self.remote, ?order, "peer byte order set");
            }
            DecodedMessage::Application {
                version,
                command,
                payload,
                ..
            } => {
                let (Some(context), Some(this)) = (self.context.upgrade(), self.arc()) else {
                    self.close(None);
                    return;
                };
                let mut payload = payload;
                if let Err(e) = dispatcher::dispatch(
                    &context,
                    Origin::Tcp(this),
                    version,
                    command,
                    &mut payload,
                ) {
                    match e {
                        ClientError::InvalidDataStream(_) => self.close(Some(&e)),
                        other => warn!(remote = %self.remote, error = %other,
                                       "response handler failed"),
                    }
                }
            }
        }
    }

    async fn send_task(
        transport: Arc<TcpTransport>,
        mut rx: mpsc::UnboundedReceiver<SendItem>,
        mut write_half: OwnedWriteHalf,
    ) {
        let mut writer = MessageWriter::new(SEND_BUFFER_SIZE);
        while let Some(item) = rx.recv().await {
            match item {
                SendItem::Message(sender) => {
                    if let Err(e) = sender(&mut writer) {
                        // A failing sender backtracks to the last message
                        // start; the connection itself is still good.
                        writer.restart_message();
                        warn!(remote = %transport.remote, error = %e, "sender failed");
                        continue;
                    }
                    let wire = writer.take_wire();
                    if wire.is_empty() {
                        continue;
                    }
                    if let Err(e) = write_half.write_all(&wire).await {
                        transport.close(Some(&ClientError::Io(e)));
                        break;
                    }
                }
                SendItem::Shutdown => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
        trace!(remote = %transport.remote, "send task finished");
    }

    async fn heartbeat_task(transport: Arc<TcpTransport>) {
        let Some(context) = transport.context.upgrade() else {
            return;
        };
        let period = context.config.beacon_period;
        let timeout = context.config.connection_timeout;
        drop(context);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if transport.is_closed() {
                break;
            }
            transport.check_responsiveness(timeout);
            let _ = transport.enqueue(Box::new(|writer: &mut MessageWriter| {
                writer.put_control(ctrl::ECHO, 0)
            }));
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("remote", &self.remote)
            .field("priority", &self.priority)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("revision", &PROTOCOL_REVISION)
            .finish()
    }
}
