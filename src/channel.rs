//! # Channel Lifecycle
//!
//! A channel is a named logical connection to server-resident data. It
//! starts life registered with the search manager, binds to a shared TCP
//! transport once a server claims its name, and carries the set of pending
//! operations that ride on that binding.
//!
//! ## State machine
//!
//! ```text
//! NEVER_CONNECTED --connect()--> CONNECTING --create ok--> CONNECTED
//!      CONNECTING --create fail--> CONNECTING (back to search)
//!      CONNECTED --transport lost--> DISCONNECTED --recovered--> CONNECTED
//!      any --destroy()--> DESTROYED
//! ```
//!
//! Exactly one of {search-registered, transport-bound} holds while the
//! channel is alive; a destroyed channel is neither. The server-side id is
//! defined only while connected.
//!
//! All state transitions run under the per-channel mutex; user callbacks
//! (connect listeners, operation completions) are always invoked after the
//! guard is released, and state is re-read afterwards because reentrant
//! API calls are allowed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{ClientError, Result};
use crate::ops::{run_user_callback, ResponseRequest};
use crate::provider::ContextInner;
use crate::transport::tcp::TcpTransport;
use crate::transport::MessageWriter;
use crate::wire::cmd;

/// Longest accepted channel name.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 500;

/// Channel connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NeverConnected,
    Connecting,
    Connected,
    Disconnected,
    Destroyed,
}

/// Connection state change delivered to connect listeners.
#[derive(Debug, Clone, Copy)]
pub struct ConnectEvent {
    pub connected: bool,
}

/// Receiver of channel connect/disconnect notifications.
///
/// Listeners are held weakly: callbacks are invoked only while the caller
/// keeps its listener alive independently.
pub trait ConnectListener: Send + Sync {
    fn connect_event(&self, event: &ConnectEvent);

    /// Out-of-band diagnostic from the channel machinery, e.g. a warning
    /// about a second server claiming this channel's name.
    fn message(&self, _text: &str) {}
}

struct Shared {
    state: ConnectionState,
    sid: Option<u32>,
    transport: Option<Arc<TcpTransport>>,
    /// CREATE_CHANNEL sent, response outstanding.
    create_pending: bool,
    /// Tie-break bookkeeping: set after warning about a second responder.
    warned_second_responder: bool,
    operations: HashMap<u64, Weak<dyn ResponseRequest>>,
}

/// Internal channel representation shared by handles, transports, the
/// search manager and operations.
pub(crate) struct ChannelImpl {
    name: String,
    cid: u32,
    priority: u16,
    context: Weak<ContextInner>,
    weak_self: Weak<ChannelImpl>,
    shared: Mutex<Shared>,
    listeners: Mutex<Vec<Weak<dyn ConnectListener>>>,
    next_op_id: AtomicU64,
}

impl ChannelImpl {
    pub(crate) fn new(
        context: &Arc<ContextInner>,
        name: String,
        cid: u32,
        priority: u16,
    ) -> Result<Arc<ChannelImpl>> {
        if name.is_empty() || name.len() > MAX_CHANNEL_NAME_LENGTH {
            return Err(ClientError::UsageError(format!(
                "invalid channel name {name:?}"
            )));
        }
        Ok(Arc::new_cyclic(|weak_self| ChannelImpl {
            name,
            cid,
            priority,
            context: Arc::downgrade(context),
            weak_self: weak_self.clone(),
            shared: Mutex::new(Shared {
                state: ConnectionState::NeverConnected,
                sid: None,
                transport: None,
                create_pending: false,
                warned_second_responder: false,
                operations: HashMap::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            next_op_id: AtomicU64::new(1),
        }))
    }

    /// A strong handle to ourselves; `None` only mid-teardown.
    fn arc(&self) -> Option<Arc<ChannelImpl>> {
        self.weak_self.upgrade()
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn cid(&self) -> u32 {
        self.cid
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Transport and SID, available only while connected.
    pub(crate) fn connected_transport(&self) -> Option<(Arc<TcpTransport>, u32)> {
        let shared = self.shared.lock();
        match (shared.state, &shared.transport, shared.sid) {
            (ConnectionState::Connected, Some(t), Some(sid)) => Some((t.clone(), sid)),
            _ => None,
        }
    }

    /// Begin searching for a server hosting this channel.
    pub(crate) fn connect(&self) {
        let (Some(context), Some(this)) = (self.context.upgrade(), self.arc()) else {
            return;
        };
        {
            let mut shared = self.shared.lock();
            match shared.state {
                ConnectionState::NeverConnected | ConnectionState::Disconnected => {
                    shared.state = ConnectionState::Connecting;
                }
                _ => return,
            }
        }
        context.search.register(&this);
    }

    /// Bind to a fixed server address, bypassing the search phase.
    pub(crate) fn connect_direct(&self, server: SocketAddr) {
        let (Some(context), Some(this)) = (self.context.upgrade(), self.arc()) else {
            return;
        };
        {
            let mut shared = self.shared.lock();
            match shared.state {
                ConnectionState::NeverConnected | ConnectionState::Disconnected => {
                    shared.state = ConnectionState::Connecting;
                    shared.create_pending = true;
                }
                _ => return,
            }
        }
        context.handle.spawn(async move { this.bind_to(server).await });
    }

    /// A server at `server` claims this channel's CID.
    ///
    /// First responder wins: while a binding exists (or is in progress),
    /// later responders produce exactly one warning and are ignored.
    pub(crate) fn search_response(&self, server: SocketAddr, sequence_id: u32) {
        let (Some(context), Some(this)) = (self.context.upgrade(), self.arc()) else {
            return;
        };
        let mut warned: Option<String> = None;
        {
            let mut shared = self.shared.lock();
            match shared.state {
                ConnectionState::Destroyed => return,
                _ if shared.transport.is_some() || shared.create_pending => {
                    let same = shared
                        .transport
                        .as_ref()
                        .map(|t| t.remote() == server)
                        .unwrap_or(false);
                    if same {
                        debug!(name = self.name, %server, "duplicate search response from bound server");
                    } else if !shared.warned_second_responder {
                        shared.warned_second_responder = true;
                        warned = Some(format!(
                            "channel {:?}: ignoring second server {} claiming CID {}",
                            self.name, server, self.cid
                        ));
                    }
                }
                _ => {
                    shared.create_pending = true;
                    trace!(name = self.name, %server, sequence_id, "search matched, binding");
                    context.handle.spawn(async move { this.bind_to(server).await });
                }
            }
        }
        if let Some(text) = warned {
            warn!("{text}");
            self.deliver_message(&text);
        }
    }

    /// Acquire the shared transport for `server` and request channel
    /// creation on it.
    async fn bind_to(self: Arc<Self>, server: SocketAddr) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        match context.clone().acquire_transport(server, self.priority).await {
            Ok(transport) => {
                {
                    let mut shared = self.shared.lock();
                    if shared.state == ConnectionState::Destroyed {
                        shared.create_pending = false;
                        return;
                    }
                    transport.register_owner(self.cid, &self);
                    shared.transport = Some(transport.clone());
                }
                context.search.unregister(self.cid);
                self.send_create_channel(&transport);
                // The circuit may have died between acquisition and owner
                // registration, in which case its disconnect notification
                // never reached us.
                if transport.is_closed() {
                    self.transport_closed(&transport);
                }
            }
            Err(e) => {
                warn!(name = self.name, %server, error = %e, "transport bind failed");
                let mut shared = self.shared.lock();
                shared.create_pending = false;
                if shared.state != ConnectionState::Destroyed {
                    drop(shared);
                    context.search.register(&self);
                }
            }
        }
    }

    fn send_create_channel(&self, transport: &Arc<TcpTransport>) {
        let cid = self.cid;
        let name = self.name.clone();
        let result = transport.enqueue(Box::new(move |writer: &mut MessageWriter| {
            writer.start_message(cmd::CREATE_CHANNEL)?;
            let buf = writer.payload();
            buf.put_u16(1);
            buf.put_u32(cid);
            buf.put_string(&name);
            writer.end_message()
        }));
        if let Err(e) = result {
            debug!(name = self.name, error = %e, "create-channel enqueue failed");
        }
    }

    /// Server verdict on CREATE_CHANNEL.
    pub(crate) fn create_channel_response(
        &self,
        transport: &Arc<TcpTransport>,
        sid: u32,
        status: crate::wire::Status,
    ) {
        let (Some(context), Some(this)) = (self.context.upgrade(), self.arc()) else {
            return;
        };
        if status.is_ok() {
            let operations = {
                let mut shared = self.shared.lock();
                if shared.state == ConnectionState::Destroyed {
                    return;
                }
                shared.state = ConnectionState::Connected;
                shared.sid = Some(sid);
                shared.create_pending = false;
                shared.warned_second_responder = false;
                snapshot_ops(&mut shared)
            };
            info!(name = self.name, cid = self.cid, sid, remote = %transport.remote(),
                  "channel connected");
            // Resubscribe outside the lock; operations may call back in.
            for op in operations {
                op.channel_connected(transport);
            }
            self.notify_listeners(ConnectEvent { connected: true });
        } else {
            warn!(name = self.name, message = status.message(),
                  "channel creation refused, searching again");
            {
                let mut shared = self.shared.lock();
                if shared.state == ConnectionState::Destroyed {
                    return;
                }
                if let Some(t) = shared.transport.take() {
                    drop(shared);
                    t.unregister_owner(self.cid);
                    shared = self.shared.lock();
                }
                shared.sid = None;
                shared.create_pending = false;
                shared.state = ConnectionState::Connecting;
            }
            context.search.register(&this);
        }
    }

    /// The bound transport closed; unbind and return to searching.
    pub(crate) fn transport_closed(&self, transport: &Arc<TcpTransport>) {
        let (Some(context), Some(this)) = (self.context.upgrade(), self.arc()) else {
            return;
        };
        let (was_connected, operations) = {
            let mut shared = self.shared.lock();
            let ours = shared
                .transport
                .as_ref()
                .map(|t| Arc::ptr_eq(t, transport))
                .unwrap_or(false);
            if !ours || shared.state == ConnectionState::Destroyed {
                return;
            }
            shared.transport = None;
            shared.sid = None;
            shared.create_pending = false;
            shared.warned_second_responder = false;
            let was_connected = shared.state == ConnectionState::Connected;
            shared.state = ConnectionState::Disconnected;
            (was_connected, snapshot_ops(&mut shared))
        };
        debug!(name = self.name, remote = %transport.remote(), "transport lost");
        for op in operations {
            op.channel_disconnect();
        }
        if was_connected {
            self.notify_listeners(ConnectEvent { connected: false });
        }
        // Still alive: go back to searching.
        if self.state() != ConnectionState::Destroyed {
            context.search.register(&this);
        }
    }

    /// The bound transport went silent past the timeout; the binding is
    /// kept but owners observe a synthetic disconnect.
    pub(crate) fn transport_unresponsive(&self) {
        let operations = {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Connected {
                return;
            }
            shared.state = ConnectionState::Disconnected;
            snapshot_ops(&mut shared)
        };
        for op in operations {
            op.channel_disconnect();
        }
        self.notify_listeners(ConnectEvent { connected: false });
    }

    /// Traffic resumed on an unresponsive transport: re-create the channel
    /// on the existing binding. The server may or may not have preserved
    /// the SID, so it is renegotiated rather than assumed.
    pub(crate) fn transport_responsive(&self, transport: &Arc<TcpTransport>) {
        {
            let mut shared = self.shared.lock();
            let ours = shared
                .transport
                .as_ref()
                .map(|t| Arc::ptr_eq(t, transport))
                .unwrap_or(false);
            if !ours || shared.state != ConnectionState::Disconnected {
                return;
            }
            shared.create_pending = true;
        }
        self.send_create_channel(transport);
    }

    /// Tear the channel down: cancel pending IO, release the transport or
    /// search registration, and forget the channel context-wide.
    pub(crate) fn destroy(&self) {
        let context = self.context.upgrade();
        let (transport, sid, operations) = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Destroyed {
                return;
            }
            shared.state = ConnectionState::Destroyed;
            let transport = shared.transport.take();
            let sid = shared.sid.take();
            let operations = snapshot_ops(&mut shared);
            shared.operations.clear();
            (transport, sid, operations)
        };
        debug!(name = self.name, cid = self.cid, "channel destroyed");
        for op in operations {
            op.destroy();
        }
        if let Some(context) = &context {
            context.search.unregister(self.cid);
            context.forget_channel(self.cid);
        }
        if let Some(transport) = transport {
            if let Some(sid) = sid {
                let cid = self.cid;
                let _ = transport.enqueue(Box::new(move |writer: &mut MessageWriter| {
                    writer.start_message(cmd::DESTROY_CHANNEL)?;
                    writer.payload().put_u32(sid);
                    writer.payload().put_u32(cid);
                    writer.end_message()
                }));
            }
            transport.unregister_owner(self.cid);
        }
    }

    // ---- operations ------------------------------------------------------

    pub(crate) fn register_operation(&self, op: Weak<dyn ResponseRequest>) -> u64 {
        let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        self.shared.lock().operations.insert(id, op);
        id
    }

    pub(crate) fn unregister_operation(&self, id: u64) {
        self.shared.lock().operations.remove(&id);
    }

    // ---- listeners -------------------------------------------------------

    pub(crate) fn add_listener(&self, listener: &Arc<dyn ConnectListener>) {
        self.listeners.lock().push(Arc::downgrade(listener));
        // A listener attached to an already-connected channel hears about
        // it immediately.
        if self.state() == ConnectionState::Connected {
            let listener = listener.clone();
            run_user_callback(move || listener.connect_event(&ConnectEvent { connected: true }));
        }
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn ConnectListener>) {
        self.listeners
            .lock()
            .retain(|w| match w.upgrade() {
                Some(l) => !Arc::ptr_eq(&l, listener),
                None => false,
            });
    }

    fn notify_listeners(&self, event: ConnectEvent) {
        let listeners: Vec<Arc<dyn ConnectListener>> = {
            let mut guard = self.listeners.lock();
            guard.retain(|w| w.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            run_user_callback(move || listener.connect_event(&event));
        }
    }

    fn deliver_message(&self, text: &str) {
        let listeners: Vec<Arc<dyn ConnectListener>> =
            self.listeners.lock().iter().filter_map(Weak::upgrade).collect();
        for listener in listeners {
            let text = text.to_string();
            run_user_callback(move || listener.message(&text));
        }
    }
}

fn snapshot_ops(shared: &mut Shared) -> Vec<Arc<dyn ResponseRequest>> {
    shared.operations.retain(|_, w| w.strong_count() > 0);
    shared.operations.values().filter_map(Weak::upgrade).collect()
}

impl std::fmt::Debug for ChannelImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("cid", &self.cid)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to a single channel.
///
/// Cloneable; the underlying channel lives in the provider's cache until
/// the provider disconnects or drops it. Operation methods come in
/// callback-based (`*_with`) and blocking flavors; the blocking flavors
/// live in [`crate::sync`].
#[derive(Clone, Debug)]
pub struct ClientChannel {
    pub(crate) inner: Arc<ChannelImpl>,
}

impl ClientChannel {
    pub(crate) fn new(inner: Arc<ChannelImpl>) -> Self {
        ClientChannel { inner }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    /// Append to the list of connect listeners.
    ///
    /// The listener is held weakly and must be kept alive by the caller
    /// for as long as notifications are wanted.
    pub fn add_connect_listener(&self, listener: &Arc<dyn ConnectListener>) {
        self.inner.add_listener(listener);
    }

    /// Remove from the list of connect listeners.
    pub fn remove_connect_listener(&self, listener: &Arc<dyn ConnectListener>) {
        self.inner.remove_listener(listener);
    }

    // ---- callback-based operations --------------------------------------
    //
    // Every callback is captured weakly: keep the callback Arc alive for
    // as long as completion is wanted, and keep the returned handle alive
    // or the operation is cancelled.

    /// Issue a request for the current value.
    pub fn get_with(
        &self,
        callback: &Arc<dyn crate::ops::GetCallback>,
        request: crate::pvdata::PvRequest,
    ) -> crate::ops::Operation {
        crate::ops::get::GetOperation::start(
            self.inner.clone(),
            Arc::downgrade(callback),
            request,
        )
    }

    /// Initiate a value change.
    pub fn put_with(
        &self,
        callback: &Arc<dyn crate::ops::PutCallback>,
        request: crate::pvdata::PvRequest,
    ) -> crate::ops::Operation {
        crate::ops::put::PutOperation::start(
            self.inner.clone(),
            Arc::downgrade(callback),
            request,
        )
    }

    /// Start a remote call; completion shares the get surface.
    pub fn rpc_with(
        &self,
        callback: &Arc<dyn crate::ops::GetCallback>,
        arguments: crate::pvdata::Value,
        request: crate::pvdata::PvRequest,
    ) -> crate::ops::Operation {
        let desc = arguments.infer_desc();
        crate::ops::rpc::RpcOperation::start(
            self.inner.clone(),
            Arc::downgrade(callback),
            arguments,
            desc,
            request,
        )
    }

    /// Begin a subscription.
    pub fn monitor_with(
        &self,
        callback: &Arc<dyn crate::ops::MonitorCallback>,
        request: crate::pvdata::PvRequest,
    ) -> crate::ops::Monitor {
        crate::ops::monitor::MonitorOperation::start(
            self.inner.clone(),
            Arc::downgrade(callback),
            request,
        )
    }

    /// Fetch the channel's type descriptor (empty subfield = whole
    /// structure).
    pub fn get_field_with(
        &self,
        callback: &Arc<dyn crate::ops::GetFieldCallback>,
        subfield: &str,
    ) -> crate::ops::Operation {
        crate::ops::get_field::GetFieldOperation::start(
            self.inner.clone(),
            Arc::downgrade(callback),
            subfield.to_string(),
        )
    }

    /// Make the server-side record process.
    pub fn process_with(
        &self,
        callback: &Arc<dyn crate::ops::ProcessCallback>,
        request: crate::pvdata::PvRequest,
    ) -> crate::ops::Operation {
        crate::ops::process::ProcessOperation::start(
            self.inner.clone(),
            Arc::downgrade(callback),
            request,
        )
    }
}
