//! Get-field operation: fetch a channel's type descriptor without data.
//!
//! Simpler than the data operations: a single request carrying the
//! sub-field name (empty for the whole structure), answered with a status
//! and descriptor.

use std::sync::{Arc, Weak};

use crate::channel::ChannelImpl;
use crate::error::{ClientError, Result};
use crate::ops::{
    run_user_callback, OpCore, OpKind, Operation, OperationControl, Phase, ResponseRequest,
};
use crate::pvdata::FieldDesc;
use crate::transport::tcp::TcpTransport;
use crate::transport::MessageWriter;
use crate::wire::{cmd, ByteBuf, Status};

/// Callback for get-field completion.
pub trait GetFieldCallback: Send + Sync {
    fn get_field_done(&self, result: Result<FieldDesc>);

    fn channel_disconnect(&self) {}
}

pub(crate) struct GetFieldOperation {
    core: OpCore,
    callback: Weak<dyn GetFieldCallback>,
    subfield: String,
}

impl GetFieldOperation {
    pub(crate) fn start(
        channel: Arc<ChannelImpl>,
        callback: Weak<dyn GetFieldCallback>,
        subfield: String,
    ) -> Operation {
        let op = Arc::new(GetFieldOperation {
            core: OpCore::new(channel, OpKind::GetField, cmd::GET_FIELD),
            callback,
            subfield,
        });
        let as_request: Arc<dyn ResponseRequest> = op.clone();
        op.core.attach(&as_request);
        Operation::new(op)
    }

    fn finish_with(&self, result: Result<FieldDesc>) {
        if self.core.try_finish() {
            if let Some(cb) = self.callback.upgrade() {
                run_user_callback(move || cb.get_field_done(result));
            }
        }
    }

    fn cancel_op(&self) {
        if self.core.is_done() {
            return;
        }
        self.core.send_destroy_request();
        self.finish_with(Err(ClientError::Cancelled));
    }
}

impl ResponseRequest for GetFieldOperation {
    fn response(
        self: Arc<Self>,
        transport: Arc<TcpTransport>,
        payload: &mut ByteBuf,
    ) -> Result<()> {
        let status = Status::decode(payload)?;
        if !status.is_ok() {
            self.finish_with(Err(ClientError::RemoteError(
                status.message().to_string(),
            )));
            return Ok(());
        }
        let desc = transport
            .deserialize_field(payload)?
            .ok_or_else(|| ClientError::bad_stream("get-field response without descriptor"))?;
        self.finish_with(Ok(desc));
        Ok(())
    }

    fn channel_connected(self: Arc<Self>, transport: &Arc<TcpTransport>) {
        if self.core.is_done() {
            return;
        }
        let as_request: Arc<dyn ResponseRequest> = self.clone();
        let Some(ioid) = self
            .core
            .bind_transport(Arc::downgrade(&as_request), transport)
        else {
            return;
        };
        self.core.state.lock().phase = Phase::RequestSent;
        let sid = match self.core.channel.connected_transport() {
            Some((_, sid)) => sid,
            None => return,
        };
        let subfield = self.subfield.clone();
        let _ = transport.enqueue(Box::new(move |writer: &mut MessageWriter| {
            writer.start_message(cmd::GET_FIELD)?;
            writer.payload().put_u32(sid);
            writer.payload().put_u32(ioid);
            writer.payload().put_string(&subfield);
            writer.end_message()
        }));
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

impl OperationControl for GetFieldOperation {
    fn channel_name(&self) -> String {
        self.core.channel.name().to_string()
    }

    fn cancel(&self) {
        self.cancel_op();
    }
}
