//! Put operation: change a channel's value.
//!
//! Wire flow: INIT → server replies with the expected structure
//! descriptor → the callback's `put_build` instantiates a value and marks
//! the fields to send → PUT carries the bitset and field data → server
//! confirms. A build error (missing `value` field, type mismatch) is a
//! usage error delivered to the originating callback only.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::ChannelImpl;
use crate::error::{ClientError, Result};
use crate::ops::{
    run_user_callback, run_user_callback_with_retry, OpCore, OpKind, Operation, OperationControl,
    Phase, ResponseRequest,
};
use crate::pvdata::{BitSet, FieldDesc, PvRequest, Value};
use crate::transport::tcp::TcpTransport;
use crate::wire::{cmd, subcmd, ByteBuf, Status};

/// Completion of a put (or process) operation.
#[derive(Debug, Clone)]
pub enum PutEvent {
    Success,
    Fail(String),
    Cancel,
}

/// Callbacks for a put operation.
pub trait PutCallback: Send + Sync {
    /// The server provided the expected structure; build the value to
    /// send and mark the fields being set.
    ///
    /// Returning an error (or panicking) fails the operation with a usage
    /// error; nothing is sent.
    fn put_build(&self, desc: &FieldDesc) -> Result<(Value, BitSet)>;

    /// The operation reached its terminal event.
    fn put_done(&self, event: PutEvent);

    /// The owning channel lost its transport; not terminal.
    fn channel_disconnect(&self) {}
}

pub(crate) struct PutOperation {
    core: OpCore,
    callback: Weak<dyn PutCallback>,
    request: PvRequest,
    desc: Mutex<Option<FieldDesc>>,
}

impl PutOperation {
    pub(crate) fn start(
        channel: Arc<ChannelImpl>,
        callback: Weak<dyn PutCallback>,
        request: PvRequest,
    ) -> Operation {
        let op = Arc::new(PutOperation {
            core: OpCore::new(channel, OpKind::Put, cmd::PUT),
            callback,
            request,
            desc: Mutex::new(None),
        });
        let as_request: Arc<dyn ResponseRequest> = op.clone();
        op.core.attach(&as_request);
        Operation::new(op)
    }

    fn deliver(&self, event: PutEvent) {
        if let Some(cb) = self.callback.upgrade() {
            let retry_cb = cb.clone();
            run_user_callback_with_retry(
                move || cb.put_done(event),
                move || retry_cb.put_done(PutEvent::Fail("callback panicked".into())),
            );
        }
    }

    fn finish_with(&self, event: PutEvent) {
        if self.core.try_finish() {
            self.deliver(event);
        }
    }

    fn cancel_op(&self) {
        if self.core.is_done() {
            return;
        }
        self.core.send_destroy_request();
        self.finish_with(PutEvent::Cancel);
    }

    /// Run `put_build` and send the resulting fields.
    fn build_and_send(&self, desc: FieldDesc) {
        let Some(cb) = self.callback.upgrade() else {
            // Nobody is listening; abandon quietly.
            self.core.send_destroy_request();
            let _ = self.core.try_finish();
            return;
        };
        let built = catch_unwind(AssertUnwindSafe(|| cb.put_build(&desc)));
        let (value, to_send) = match built {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.core.send_destroy_request();
                self.finish_with(PutEvent::Fail(e.to_string()));
                return;
            }
            Err(_) => {
                self.core.send_destroy_request();
                self.finish_with(PutEvent::Fail("put_build panicked".into()));
                return;
            }
        };
        let sent = self.core.send_request(subcmd::DEFAULT, move |buf| {
            to_send.encode(buf);
            value.encode_masked(&desc, &to_send, buf)
        });
        if sent.is_ok() {
            self.core.state.lock().phase = Phase::RequestSent;
        }
    }
}

impl ResponseRequest for PutOperation {
    fn response(
        self: Arc<Self>,
        transport: Arc<TcpTransport>,
        payload: &mut ByteBuf,
    ) -> Result<()> {
        let subcommand = payload.get_u8()?;
        let status = Status::decode(payload)?;
        match subcommand {
            subcmd::INIT => {
                if !status.is_ok() {
                    self.finish_with(PutEvent::Fail(status.message().to_string()));
                    return Ok(());
                }
                let desc = transport
                    .deserialize_field(payload)?
                    .ok_or_else(|| ClientError::bad_stream("put init without descriptor"))?;
                *self.desc.lock() = Some(desc.clone());
                self.core.state.lock().phase = Phase::Ready;
                self.build_and_send(desc);
            }
            subcmd::DEFAULT => {
                if self.core.state.lock().phase != Phase::RequestSent {
                    debug!("ignoring put confirmation outside the request phase");
                    return Ok(());
                }
                if status.is_ok() {
                    self.finish_with(PutEvent::Success);
                } else {
                    self.finish_with(PutEvent::Fail(status.message().to_string()));
                }
            }
            other => debug!(subcommand = other, "unexpected put subcommand"),
        }
        Ok(())
    }

    fn channel_connected(self: Arc<Self>, transport: &Arc<TcpTransport>) {
        if self.core.is_done() {
            return;
        }
        let as_request: Arc<dyn ResponseRequest> = self.clone();
        if self
            .core
            .bind_transport(Arc::downgrade(&as_request), transport)
            .is_some()
        {
            let _ = self.core.send_init(self.request.text().to_string());
        }
    }

    fn channel_disconnect(&self) {
        self.core.unbind_transport();
        if !self.core.is_done() {
            if let Some(cb) = self.callback.upgrade() {
                run_user_callback(move || cb.channel_disconnect());
            }
        }
    }

    fn destroy(&self) {
        self.cancel_op();
    }
}

impl OperationControl for PutOperation {
    fn channel_name(&self) -> String {
        self.core.channel.name().to_string()
    }

    fn cancel(&self) {
        self.cancel_op();
    }
}
