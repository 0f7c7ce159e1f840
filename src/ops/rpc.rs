//! RPC operation: execute a remote call with structured arguments.
//!
//! Shares the completion surface with get (`GetCallback`/`GetEvent`): the
//! terminal success event carries the structure returned by the service.
//! Wire flow: INIT → server acknowledges → the RPC request carries the
//! argument descriptor (through the outgoing introspection cache) and the
//! full argument value → server answers with a result descriptor and
//! value.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::channel::ChannelImpl;
use crate::error::{ClientError, Result};
use crate::ops::{
    run_user_callback, run_user_callback_with_retry, GetCallback, GetEvent, OpCore, OpKind,
    Operation, OperationControl, Phase, ResponseRequest,
};
use crate::pvdata::{FieldDesc, PvRequest, Value};
use crate::transport::tcp::TcpTransport;
use crate::wire::{cmd, subcmd, ByteBuf, Status};

pub(crate) struct RpcOperation {
    core: OpCore,
    callback: Weak<dyn GetCallback>,
    request: PvRequest,
    arguments: Value,
    arguments_desc: FieldDesc,
}

impl RpcOperation {
    pub(crate) fn start(
        channel: Arc<ChannelImpl>,
        callback: Weak<dyn GetCallback>,
        arguments: Value,
        arguments_desc: FieldDesc,
        request: PvRequest,
    ) -> Operation {
        let op = Arc::new(RpcOperation {
            core: OpCore::new(channel, OpKind::Rpc, cmd::RPC),
            callback,
            request,
            arguments,
            arguments_desc,
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

    fn send_call(&self, transport: &Arc<TcpTransport>) {
        let arguments = self.arguments.clone();
        let desc = self.arguments_desc.clone();
        let transport = transport.clone();
        let sent = self.core.send_request(subcmd::DEFAULT, move |buf| {
            transport.serialize_field(&desc, buf);
            arguments.encode_full(&desc, buf)
        });
        if sent.is_ok() {
            self.core.state.lock().phase = Phase::RequestSent;
        }
    }
}

impl ResponseRequest for RpcOperation {
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
                self.core.state.lock().phase = Phase::Ready;
                self.send_call(&transport);
            }
            subcmd::DEFAULT => {
                if !status.is_ok() {
                    self.finish_with(GetEvent::Fail(status.message().to_string()));
                    return Ok(());
                }
                let desc = transport
                    .deserialize_field(payload)?
                    .ok_or_else(|| ClientError::bad_stream("rpc result without descriptor"))?;
                let value = Value::decode_full(&desc, payload)?;
                self.finish_with(GetEvent::Success(value));
            }
            other => debug!(subcommand = other, "unexpected rpc subcommand"),
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

impl OperationControl for RpcOperation {
    fn channel_name(&self) -> String {
        self.core.channel.name().to_string()
    }

    fn cancel(&self) {
        self.cancel_op();
    }
}
