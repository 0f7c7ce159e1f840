//! Process operation: make the server-side record process without
//! transferring data. Completion reuses the put surface (`PutEvent`).

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::channel::ChannelImpl;
use crate::error::Result;
use crate::ops::{
    run_user_callback, run_user_callback_with_retry, OpCore, OpKind, Operation, OperationControl,
    Phase, PutEvent, ResponseRequest,
};
use crate::pvdata::PvRequest;
use crate::transport::tcp::TcpTransport;
use crate::wire::{cmd, subcmd, ByteBuf, Status};

/// Callback for process completion.
pub trait ProcessCallback: Send + Sync {
    fn process_done(&self, event: PutEvent);

    fn channel_disconnect(&self) {}
}

pub(crate) struct ProcessOperation {
    core: OpCore,
    callback: Weak<dyn ProcessCallback>,
    request: PvRequest,
}

impl ProcessOperation {
    pub(crate) fn start(
        channel: Arc<ChannelImpl>,
        callback: Weak<dyn ProcessCallback>,
        request: PvRequest,
    ) -> Operation {
        let op = Arc::new(ProcessOperation {
            core: OpCore::new(channel, OpKind::Process, cmd::PROCESS),
            callback,
            request,
        });
        let as_request: Arc<dyn ResponseRequest> = op.clone();
        op.core.attach(&as_request);
        Operation::new(op)
    }

    fn deliver(&self, event: PutEvent) {
        if let Some(cb) = self.callback.upgrade() {
            let retry_cb = cb.clone();
            run_user_callback_with_retry(
                move || cb.process_done(event),
                move || retry_cb.process_done(PutEvent::Fail("callback panicked".into())),
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
}

impl ResponseRequest for ProcessOperation {
    fn response(
        self: Arc<Self>,
        _transport: Arc<TcpTransport>,
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
                self.core.state.lock().phase = Phase::Ready;
                if self.core.send_request(subcmd::PROCESS, |_| Ok(())).is_ok() {
                    self.core.state.lock().phase = Phase::RequestSent;
                }
            }
            subcmd::PROCESS => {
                if status.is_ok() {
                    self.finish_with(PutEvent::Success);
                } else {
                    self.finish_with(PutEvent::Fail(status.message().to_string()));
                }
            }
            other => debug!(subcommand = other, "unexpected process subcommand"),
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

impl OperationControl for ProcessOperation {
    fn channel_name(&self) -> String {
        self.core.channel.name().to_string()
    }

    fn cancel(&self) {
        self.cancel_op();
    }
}
