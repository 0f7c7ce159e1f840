//! # Operations
//!
//! Per-channel request machinery: get, put, rpc, monitor, get-field and
//! process. Every operation owns a client-side IOID unique within its
//! transport, registers itself in the transport's in-flight table, and
//! walks a small state machine:
//!
//! ```text
//! INITIAL -> INIT_SENT -> READY -> (GET_SENT | PUT_SENT | ...) -> READY ...
//!                                   any -> DESTROYED
//! ```
//!
//! ## Delivery contract
//!
//! - Exactly one terminal event (`Success | Fail | Cancel`) per accepted
//!   get/put/rpc, never two, never zero.
//! - Disconnect of the bound transport delivers a disconnect notification;
//!   it is not terminal, and the operation resubscribes itself when the
//!   channel reconnects.
//! - `cancel` is immediate locally (later completions are suppressed),
//!   idempotent, and sends a best-effort destroy request to the server.
//!
//! ## Ownership
//!
//! The user-held [`Operation`] (or [`Monitor`](crate::ops::monitor::Monitor))
//! handle owns the operation; dropping the last handle cancels it.
//! Channels and transports keep only weak references, and user callbacks
//! are invoked through weak upgrades so an abandoned callback is simply
//! skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::channel::ChannelImpl;
use crate::error::Result;
use crate::pvdata::{BitSet, FieldDesc, Value};
use crate::transport::tcp::TcpTransport;
use crate::transport::{MessageWriter, SendFn};
use crate::wire::{cmd, subcmd, ByteBuf};

pub mod get;
pub mod get_field;
pub mod monitor;
pub mod process;
pub mod put;
pub mod rpc;

pub use get::{GetCallback, GetEvent};
pub use get_field::GetFieldCallback;
pub use monitor::{Monitor, MonitorCallback, MonitorElement, MonitorEvent};
pub use process::ProcessCallback;
pub use put::{PutCallback, PutEvent};

/// Operation kinds, as they appear in wire requests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Get,
    Put,
    PutGet,
    Rpc,
    Monitor,
    GetField,
    Process,
    Array,
    ChannelCreate,
    ChannelDestroy,
}

/// In-flight request registered in a transport's IOID table.
///
/// Implemented by every operation type; the dispatcher routes data
/// responses here, and the channel fans out connect/disconnect/destroy.
pub(crate) trait ResponseRequest: Send + Sync {
    /// Handle a data response. The IOID has already been consumed from the
    /// payload.
    fn response(self: Arc<Self>, transport: Arc<TcpTransport>, payload: &mut ByteBuf)
        -> Result<()>;

    /// The channel (re)connected: (re)issue the INIT request.
    fn channel_connected(self: Arc<Self>, transport: &Arc<TcpTransport>);

    /// The channel lost its transport; not terminal.
    fn channel_disconnect(&self);

    /// Cancel/teardown path; idempotent.
    fn destroy(&self);

    /// Out-of-band server text addressed to this operation's requester.
    fn message(&self, text: &str) {
        debug!(text, "server message");
    }
}

/// Run a user callback, isolating panics per the delivery policy: log the
/// first failure, give the callback one chance to observe a failure event,
/// then only log.
pub(crate) fn run_user_callback<F: FnOnce()>(f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("unhandled panic in user callback");
    }
}

/// Deliver an event, retrying once with a failure event if the callback
/// panics; a second panic is only logged.
pub(crate) fn run_user_callback_with_retry<F, G>(deliver: F, deliver_fail: G)
where
    F: FnOnce(),
    G: FnOnce(),
{
    if catch_unwind(AssertUnwindSafe(deliver)).is_err() {
        error!("unhandled panic in user callback, retrying with failure event");
        if catch_unwind(AssertUnwindSafe(deliver_fail)).is_err() {
            error!("unhandled panic in user callback while delivering failure event");
        }
    }
}

/// Operation phases shared by all kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Initial,
    InitSent,
    Ready,
    RequestSent,
    Destroyed,
}

pub(crate) struct CoreState {
    pub(crate) phase: Phase,
    pub(crate) ioid: Option<u32>,
    pub(crate) transport: Option<Arc<TcpTransport>>,
    /// Terminal event delivered (or cancelled); later events are
    /// suppressed.
    pub(crate) done: bool,
}

/// State common to every operation kind.
pub(crate) struct OpCore {
    pub(crate) channel: Arc<ChannelImpl>,
    pub(crate) kind: OpKind,
    command: u8,
    op_id: Mutex<Option<u64>>,
    pub(crate) state: Mutex<CoreState>,
}

impl OpCore {
    pub(crate) fn new(channel: Arc<ChannelImpl>, kind: OpKind, command: u8) -> OpCore {
        OpCore {
            channel,
            kind,
            command,
            op_id: Mutex::new(None),
            state: Mutex::new(CoreState {
                phase: Phase::Initial,
                ioid: None,
                transport: None,
                done: false,
            }),
        }
    }

    /// Register with the owning channel; kicks off INIT immediately when
    /// the channel is already connected.
    pub(crate) fn attach(&self, this: &Arc<dyn ResponseRequest>) {
        *self.op_id.lock() = Some(self.channel.register_operation(Arc::downgrade(this)));
        if let Some((transport, _sid)) = self.channel.connected_transport() {
            this.clone().channel_connected(&transport);
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// Mark terminal; returns false when a terminal event was already
    /// delivered (or the operation was cancelled).
    pub(crate) fn try_finish(&self) -> bool {
        let mut state = self.state.lock();
        if state.done {
            return false;
        }
        state.done = true;
        state.phase = Phase::Destroyed;
        let ioid = state.ioid.take();
        let transport = state.transport.take();
        drop(state);
        if let (Some(ioid), Some(transport)) = (ioid, transport) {
            transport.unregister_request(ioid);
        }
        if let Some(id) = self.op_id.lock().take() {
            self.channel.unregister_operation(id);
        }
        true
    }

    /// Register an IOID on `transport` and remember the binding.
    pub(crate) fn bind_transport(
        &self,
        this: Weak<dyn ResponseRequest>,
        transport: &Arc<TcpTransport>,
    ) -> Option<u32> {
        let mut state = self.state.lock();
        if state.done {
            return None;
        }
        if let (Some(old_ioid), Some(old_transport)) = (state.ioid.take(), state.transport.take())
        {
            old_transport.unregister_request(old_ioid);
        }
        let ioid = transport.register_request(this);
        state.ioid = Some(ioid);
        state.transport = Some(transport.clone());
        state.phase = Phase::InitSent;
        Some(ioid)
    }

    /// The transport went away: forget the binding, reset to INITIAL.
    pub(crate) fn unbind_transport(&self) {
        let mut state = self.state.lock();
        state.ioid = None;
        state.transport = None;
        if !state.done {
            state.phase = Phase::Initial;
        }
    }

    /// Enqueue a request frame `(command, sid, ioid, subcommand, body)` on
    /// the current transport.
    pub(crate) fn send_request(
        &self,
        subcommand: u8,
        body: impl FnOnce(&mut ByteBuf) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let (transport, ioid) = {
            let state = self.state.lock();
            match (&state.transport, state.ioid) {
                (Some(t), Some(ioid)) => (t.clone(), ioid),
                _ => return Err(crate::error::ClientError::ConnectionClosed),
            }
        };
        let sid = match self.channel.connected_transport() {
            Some((_, sid)) => sid,
            None => return Err(crate::error::ClientError::ConnectionClosed),
        };
        let command = self.command;
        let sender: SendFn = Box::new(move |writer: &mut MessageWriter| {
            writer.start_message(command)?;
            writer.payload().put_u32(sid);
            writer.payload().put_u32(ioid);
            writer.payload().put_u8(subcommand);
            body(writer.payload())?;
            writer.end_message()
        });
        transport.enqueue(sender)
    }

    /// Best-effort cancellation on the wire: DESTROY_REQUEST carrying the
    /// IOID, without waiting for confirmation.
    pub(crate) fn send_destroy_request(&self) {
        let (transport, ioid) = {
            let state = self.state.lock();
            match (&state.transport, state.ioid) {
                (Some(t), Some(ioid)) => (t.clone(), ioid),
                _ => return,
            }
        };
        let sid = self
            .channel
            .connected_transport()
            .map(|(_, sid)| sid)
            .unwrap_or(0);
        trace!(ioid, kind = ?self.kind, "sending destroy request");
        let _ = transport.enqueue(Box::new(move |writer: &mut MessageWriter| {
            writer.start_message(cmd::DESTROY_REQUEST)?;
            writer.payload().put_u32(sid);
            writer.payload().put_u32(ioid);
            writer.end_message()
        }));
    }

    /// Standard INIT request: pvRequest descriptor as the body.
    pub(crate) fn send_init(&self, request_text: String) -> Result<()> {
        self.send_request(subcmd::INIT, move |buf| {
            buf.put_string(&request_text);
            Ok(())
        })
    }
}

/// Handle for an in-progress get/put/rpc/get-field/process operation.
///
/// The handle owns the operation: dropping the last handle cancels it, so
/// a caller that wants completion must keep it alive (this is the
/// canonical disposal path; no explicit destroy call exists).
pub struct Operation {
    inner: Arc<dyn OperationControl>,
}

pub(crate) trait OperationControl: Send + Sync {
    fn channel_name(&self) -> String;
    fn cancel(&self);
}

impl Operation {
    pub(crate) fn new(inner: Arc<dyn OperationControl>) -> Operation {
        Operation { inner }
    }

    /// Name of the owning channel.
    pub fn name(&self) -> String {
        self.inner.channel_name()
    }

    /// Immediate local cancellation; does not wait for remote
    /// confirmation. Calling it again is a no-op.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("channel", &self.inner.channel_name())
            .finish()
    }
}

/// Decode a changed-bitset + masked value payload onto a defaulted base.
pub(crate) fn decode_masked_value(
    desc: &FieldDesc,
    payload: &mut ByteBuf,
) -> Result<(Value, BitSet)> {
    let changed = BitSet::decode(payload)?;
    let mut value = Value::default_for(desc)?;
    value.apply_masked(desc, &changed, payload)?;
    Ok((value, changed))
}
