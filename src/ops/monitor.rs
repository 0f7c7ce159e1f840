//! # Monitor Operation
//!
//! Subscription to a channel's value changes. After INIT the server sends
//! the structure descriptor; the client allocates a bounded element queue
//! (size from the pvRequest `queueSize` option, default 2) and starts the
//! stream. Each update carries a changed bitset, a (possibly delta)
//! structure and an overrun bitset.
//!
//! ## Queue and overrun semantics
//!
//! Updates fill the queue in arrival order. When the queue is saturated,
//! a new update coalesces into the newest slot: the structural values are
//! replaced by the latest data while the overrun bitset accumulates every
//! changed bit that was overwritten. `poll` hands out elements through a
//! scoped handle whose drop returns the slot; with pipelining enabled,
//! releasing enough slots sends a flow-control acknowledgement so the
//! server resumes pushing.
//!
//! After the server's unlisten (source closed) and queue drain, the
//! subscription is complete.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::channel::ChannelImpl;
use crate::error::{ClientError, Result};
use crate::ops::{
    run_user_callback, OpCore, OpKind, OperationControl, Phase, ResponseRequest,
};
use crate::pvdata::{BitSet, FieldDesc, PvRequest, Value};
use crate::transport::tcp::TcpTransport;
use crate::wire::{cmd, subcmd, ByteBuf, Status};

/// Subscription queue/state change events.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// The queue became (or stayed) non-empty; call `poll`.
    Data,
    /// The underlying channel disconnected; the subscription resumes
    /// automatically on reconnect.
    Disconnect,
    /// `cancel` was called; no further events.
    Cancel,
    /// The subscription ended in an error.
    Fail(String),
}

/// Receiver of monitor events; held weakly by the subscription.
pub trait MonitorCallback: Send + Sync {
    fn monitor_event(&self, event: &MonitorEvent);
}

/// One delivered subscription update.
///
/// A scoped handle: dropping it returns the queue slot to the
/// subscription (and may trigger a pipeline acknowledgement), so holding
/// elements is what exerts back-pressure.
pub struct MonitorElement {
    pub value: Value,
    pub changed: BitSet,
    pub overrun: BitSet,
    owner: Weak<MonitorOperation>,
}

impl Drop for MonitorElement {
    fn drop(&mut self) {
        if let Some(op) = self.owner.upgrade() {
            op.release_element();
        }
    }
}

impl std::fmt::Debug for MonitorElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorElement")
            .field("changed", &self.changed)
            .field("overrun", &self.overrun)
            .finish()
    }
}

struct ElementData {
    value: Value,
    changed: BitSet,
    overrun: BitSet,
}

struct MonState {
    desc: Option<FieldDesc>,
    /// Most recent full value; server deltas are applied here.
    latest: Option<Value>,
    queue: VecDeque<ElementData>,
    /// Elements handed out and not yet released.
    in_use: usize,
    capacity: usize,
    started: bool,
    unlistened: bool,
    /// The last poll returned nothing; the next data event may fire.
    seen_empty: bool,
    released_since_ack: usize,
}

pub(crate) struct MonitorOperation {
    core: OpCore,
    callback: Weak<dyn MonitorCallback>,
    request: PvRequest,
    mon: Mutex<MonState>,
}

impl MonitorOperation {
    pub(crate) fn start(
        channel: Arc<ChannelImpl>,
        callback: Weak<dyn MonitorCallback>,
        request: PvRequest,
    ) -> Monitor {
        let capacity = request.queue_size().max(2);
        let op = Arc::new(MonitorOperation {
            core: OpCore::new(channel, OpKind::Monitor, cmd::MONITOR),
            callback,
            request,
            mon: Mutex::new(MonState {
                desc: None,
                latest: None,
                queue: VecDeque::new(),
                in_use: 0,
                capacity,
                started: false,
                unlistened: false,
                seen_empty: true,
                released_since_ack: 0,
            }),
        });
        let as_request: Arc<dyn ResponseRequest> = op.clone();
        op.core.attach(&as_request);
        Monitor { inner: op }
    }

    fn deliver(&self, event: MonitorEvent) {
        if let Some(cb) = self.callback.upgrade() {
            run_user_callback(move || cb.monitor_event(&event));
        }
    }

    fn fail(&self, message: String) {
        if self.core.try_finish() {
            self.deliver(MonitorEvent::Fail(message));
        }
    }

    fn cancel_op(&self) {
        if self.core.is_done() {
            return;
        }
        let started = {
            let mut mon = self.mon.lock();
            // Cancellation drains whatever the user has not polled.
            mon.queue.clear();
            std::mem::take(&mut mon.started)
        };
        if started {
            let _ = self.core.send_request(subcmd::STOP, |_| Ok(()));
        }
        self.core.send_destroy_request();
        if self.core.try_finish() {
            self.deliver(MonitorEvent::Cancel);
        }
    }

    /// One server update: apply the delta, enqueue or coalesce.
    fn data_update(&self, payload: &mut ByteBuf) -> Result<()> {
        let mut mon = self.mon.lock();
        let (Some(desc), Some(latest)) = (mon.desc.clone(), mon.latest.as_mut()) else {
            drop(mon);
            // Update before the descriptor: the stream no longer matches
            // what this subscription was built on.
            self.fail("monitor update before structure descriptor".into());
            return Ok(());
        };
        let changed = BitSet::decode(payload)?;
        latest.apply_masked(&desc, &changed, payload)?;
        let snapshot = latest.clone();
        let overrun = BitSet::decode(payload)?;

        let saturated = mon.queue.len() + mon.in_use >= mon.capacity;
        if saturated {
            match mon.queue.back_mut() {
                Some(slot) => {
                    // Newest slot absorbs the update: values replaced,
                    // overwritten change bits accumulate as overrun.
                    slot.overrun.or_with(&slot.changed);
                    slot.overrun.or_with(&overrun);
                    slot.changed.or_with(&changed);
                    slot.value = snapshot;
                }
                None => {
                    // Every slot is held by the user; queue the update
                    // anyway rather than lose it.
                    trace!(name = self.core.channel.name(), "monitor queue oversubscribed");
                    mon.queue.push_back(ElementData {
                        value: snapshot,
                        changed,
                        overrun,
                    });
                }
            }
        } else {
            mon.queue.push_back(ElementData {
                value: snapshot,
                changed,
                overrun,
            });
        }
        drop(mon);
        self.deliver(MonitorEvent::Data);
        Ok(())
    }

    fn poll_element(&self, owner: Weak<MonitorOperation>) -> Option<MonitorElement> {
        let mut mon = self.mon.lock();
        match mon.queue.pop_front() {
            Some(data) => {
                mon.in_use += 1;
                mon.seen_empty = false;
                Some(MonitorElement {
                    value: data.value,
                    changed: data.changed,
                    overrun: data.overrun,
                    owner,
                })
            }
            None => {
                mon.seen_empty = true;
                None
            }
        }
    }

    fn is_complete(&self) -> bool {
        let mon = self.mon.lock();
        mon.unlistened && mon.queue.is_empty()
    }

    /// A held element was dropped; free its slot and acknowledge when the
    /// pipeline threshold is crossed.
    fn release_element(&self) {
        let ack = {
            let mut mon = self.mon.lock();
            mon.in_use = mon.in_use.saturating_sub(1);
            if !self.request.pipeline() {
                None
            } else {
                mon.released_since_ack += 1;
                let threshold =
                    ((mon.capacity * self.request.ack_percent() as usize) / 100).max(1);
                if mon.released_since_ack >= threshold {
                    Some(std::mem::take(&mut mon.released_since_ack) as i32)
                } else {
                    None
                }
            }
        };
        if let Some(nfree) = ack {
            trace!(nfree, "sending pipeline acknowledgement");
            let _ = self.core.send_request(subcmd::PIPELINE_ACK, move |buf| {
                buf.put_i32(nfree);
                Ok(())
            });
        }
    }
}

impl ResponseRequest for MonitorOperation {
    fn response(
        self: Arc<Self>,
        transport: Arc<TcpTransport>,
        payload: &mut ByteBuf,
    ) -> Result<()> {
        let subcommand = payload.get_u8()?;
        match subcommand {
            subcmd::INIT => {
                let status = Status::decode(payload)?;
                if !status.is_ok() {
                    self.fail(status.message().to_string());
                    return Ok(());
                }
                let desc = transport
                    .deserialize_field(payload)?
                    .ok_or_else(|| ClientError::bad_stream("monitor init without descriptor"))?;
                {
                    let mut mon = self.mon.lock();
                    mon.latest = Some(Value::default_for(&desc)?);
                    mon.desc = Some(desc);
                }
                self.core.state.lock().phase = Phase::Ready;
                if self.core.send_request(subcmd::START, |_| Ok(())).is_ok() {
                    self.mon.lock().started = true;
                }
            }
            subcmd::DEFAULT => {
                self.data_update(payload)?;
            }
            subcmd::UNLISTEN => {
                debug!(name = self.core.channel.name(), "monitor unlisten");
                let notify = {
                    let mut mon = self.mon.lock();
                    mon.unlistened = true;
                    mon.started = false;
                    mon.seen_empty
                };
                if notify {
                    // The user already drained the queue; poke them so the
                    // completion is observed.
                    self.deliver(MonitorEvent::Data);
                }
            }
            other => warn!(subcommand = other, "unexpected monitor subcommand"),
        }
        Ok(())
    }

    fn channel_connected(self: Arc<Self>, transport: &Arc<TcpTransport>) {
        if self.core.is_done() || self.mon.lock().unlistened {
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
        self.mon.lock().started = false;
        if !self.core.is_done() {
            self.deliver(MonitorEvent::Disconnect);
        }
    }

    fn destroy(&self) {
        self.cancel_op();
    }
}

impl OperationControl for MonitorOperation {
    fn channel_name(&self) -> String {
        self.core.channel.name().to_string()
    }

    fn cancel(&self) {
        self.cancel_op();
    }
}

/// Handle for a monitor subscription.
///
/// Owns the subscription: dropping the handle cancels it.
pub struct Monitor {
    pub(crate) inner: Arc<MonitorOperation>,
}

impl Monitor {
    /// Channel name.
    pub fn name(&self) -> String {
        self.inner.core.channel.name().to_string()
    }

    /// Remove the front element from the queue and take ownership of it.
    ///
    /// Returns `None` when the queue is empty; a `Data` event will not be
    /// repeated until a poll has observed the empty queue.
    pub fn poll(&self) -> Option<MonitorElement> {
        self.inner.poll_element(Arc::downgrade(&self.inner))
    }

    /// True once the server has unlistened and the queue is drained.
    pub fn complete(&self) -> bool {
        self.inner.is_complete()
    }

    /// Immediate cancellation: stops the stream, drains the queue and
    /// delivers a final `Cancel` event. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel_op();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.inner.cancel_op();
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor").field("name", &self.name()).finish()
    }
}
