//! Get operation: retrieve the current value of a channel.
//!
//! Wire flow: INIT (carrying the pvRequest) → server replies with the
//! structure descriptor → GET → server replies with a changed bitset and
//! the selected field data. The callback sees exactly one terminal event.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::ChannelImpl;
use crate::error::{ClientError, Result};
use crate::ops::{
    decode_masked_value, run_user_callback, run_user_callback_with_retry, OpCore, OpKind,
    Operation, OperationControl, Phase, ResponseRequest,
};
use crate::pvdata::{PvRequest, Value};
use crate::transport::tcp::TcpTransport;
use crate::wire::{cmd, subcmd, ByteBuf, Status};

/// Completion of a get (or rpc) operation.
#[derive(Debug, Clone)]
pub enum GetEvent {
    /// The request worked; here is the data.
    Success(Value),
    /// The request ended in failure; the message explains.
    Fail(String),
    /// The request was cancelled before completion.
    Cancel,
}

/// Callback for get and rpc completion.
///
/// Held weakly by the operation: keep the callback alive for as long as
/// completion is wanted.
pub trait GetCallback: Send + Sync {
    /// The operation reached its terminal event.
    fn get_done(&self, event: GetEvent);

    /// The owning channel lost its transport; not terminal.
    fn channel_disconnect(&self) {}
}

pub(crate) struct GetOperation {
    core: OpCore,
    callback: Weak<dyn GetCallback>,
    request: PvRequest,
    desc: Mutex<Option<crate::pvdata::FieldDesc>>,
}

impl GetOperation {
    pub(crate) fn start(
        channel: Arc<ChannelImpl>,
        callback: Weak<dyn GetCallback>,
        request: PvRequest,
    ) -> Operation {
        let op = Arc::new(GetOperation {
            core: OpCore::new(channel, OpKind::Get, cmd::GET),
            callback,
            request,
            desc: Mutex::new(None),
        });
        let as_request: Arc<dyn ResponseRequest> = op.clone();
        op.core.attach(&as_request);
        Operation::new(op)
    }

    fn deliver(&self, event: GetEvent) {
        if let Some(cb) = self.callback.upgrade() {
            let retry_cb = cb.clone();
            run_user_callback_with_retry(
                move || cb.get_done(event),
                move || retry_cb.get_done(GetEvent::Fail("callback panicked".into())),
            );
        }
    }

    fn finish_with(&self, event: GetEvent) {
        if self.core.try_finish() {
            self.deliver(event);
        }
    }

    fn cancel_op(&self) {
        if self.core.is_done() {
            return;
        }
        self.core.send_destroy_request();
        self.finish_with(GetEvent::Cancel);
    }
}

impl ResponseRequest for GetOperation {
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
                    self.finish_with(GetEvent::Fail(status.message().to_string()));
                    return Ok(());
                }
                let desc = transport
                    .deserialize_field(payload)?
                    .ok_or_else(|| ClientError::bad_stream("get init without descriptor"))?;
                *self.desc.lock() = Some(desc);
                self.core.state.lock().phase = Phase::Ready;
                // One-shot semantics: fetch immediately after INIT.
                if self.core.send_request(subcmd::GET, |_| Ok(())).is_ok() {
                    self.core.state.lock().phase = Phase::RequestSent;
                }
            }
            subcmd::GET => {
                if self.core.state.lock().phase != Phase::RequestSent {
                    // Stale data from before a reconnect; the request will
                    // be reissued.
                    debug!("ignoring get data outside the request phase");
                    return Ok(());
                }
                if !status.is_ok() {
                    self.finish_with(GetEvent::Fail(status.message().to_string()));
                    return Ok(());
                }
                let desc = self
                    .desc
                    .lock()
                    .clone()
                    .ok_or_else(|| ClientError::bad_stream("get data before descriptor"))?;
                let (value, _changed) = decode_masked_value(&desc, payload)?;
                self.finish_with(GetEvent::Success(value));
            }
            other => debug!(subcommand = other, "unexpected get subcommand"),
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

impl OperationControl for GetOperation {
    fn channel_name(&self) -> String {
        self.core.channel.name().to_string()
    }

    fn cancel(&self) {
        self.cancel_op();
    }
}
