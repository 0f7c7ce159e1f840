//! # Blocking Wrappers
//!
//! Synchronous, timed convenience methods over the callback-based
//! operations. Each wrapper builds a private completion holder (a mutex, a
//! condition variable and the result slot), issues the operation, and
//! parks the calling thread until completion or timeout; on timeout the
//! operation is cancelled before the error is raised, so no callback can
//! fire afterwards.
//!
//! [`MonitorSync`] is the subscription variant: it can share one
//! [`SyncEvent`] across several subscriptions so a single waiter can
//! multiplex them with `poll`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::channel::ClientChannel;
use crate::error::{ClientError, Result};
use crate::ops::{
    GetCallback, GetEvent, Monitor, MonitorCallback, MonitorEvent, PutCallback, PutEvent,
};
use crate::pvdata::{BitSet, FieldDesc, PvRequest, ScalarKind, Value};

/// Binary event usable across threads; `wait` consumes a pending signal.
///
/// Several [`MonitorSync`] subscriptions may share one event, in which
/// case a woken waiter polls each subscription to find the one with news.
pub struct SyncEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Default for SyncEvent {
    fn default() -> Self {
        SyncEvent::new()
    }
}

impl SyncEvent {
    pub fn new() -> SyncEvent {
        SyncEvent {
            signalled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        *self.signalled.lock() = true;
        self.cond.notify_all();
    }

    /// Wait for a signal; `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock();
        let deadline = std::time::Instant::now() + timeout;
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                return false;
            }
        }
        *signalled = false;
        true
    }
}

/// Completion holder shared by the timed get/put/rpc wrappers.
struct WaitCommon<E> {
    slot: Mutex<Option<E>>,
    cond: Condvar,
}

impl<E> WaitCommon<E> {
    fn new() -> Self {
        WaitCommon {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn complete(&self, event: E) {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            warn!("double completion event delivered to a blocking wrapper");
            return;
        }
        *slot = Some(event);
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<E> {
        let mut slot = self.slot.lock();
        let deadline = std::time::Instant::now() + timeout;
        while slot.is_none() {
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                return Err(ClientError::Timeout);
            }
        }
        Ok(slot.take().expect("completion present"))
    }
}

struct GetWait {
    common: WaitCommon<GetEvent>,
}

impl GetCallback for GetWait {
    fn get_done(&self, event: GetEvent) {
        self.common.complete(event);
    }
}

struct PutValueWait {
    common: WaitCommon<PutEvent>,
    value: Value,
}

impl PutCallback for PutValueWait {
    fn put_build(&self, desc: &FieldDesc) -> Result<(Value, BitSet)> {
        let index = desc.field_index("value").ok_or_else(|| {
            ClientError::UsageError("PV has no 'value' sub-field".into())
        })?;
        let target = desc.field("value").expect("index implies presence");
        let converted = convert_to(&self.value, target)?;
        let mut root = Value::default_for(desc)?;
        if let Value::Structure(fields) = &mut root {
            fields[index].1 = converted;
        }
        Ok((root, BitSet::with_bit(index + 1)))
    }

    fn put_done(&self, event: PutEvent) {
        self.common.complete(event);
    }
}

/// Convert a caller-supplied scalar onto the server's field type.
///
/// Numeric kinds convert freely; anything else must match exactly. A
/// non-scalar target (e.g. an enumeration structure) is refused as a
/// usage error rather than silently coerced.
fn convert_to(value: &Value, target: &FieldDesc) -> Result<Value> {
    let kind = match target {
        FieldDesc::Scalar(kind) => *kind,
        other => {
            return Err(ClientError::UsageError(format!(
                "'value' sub-field is not a scalar (found {other:?})"
            )))
        }
    };
    let converted = match (kind, value) {
        (ScalarKind::Boolean, Value::Boolean(v)) => Value::Boolean(*v),
        (ScalarKind::String, Value::Str(v)) => Value::Str(v.clone()),
        (ScalarKind::Byte, v) => Value::Byte(numeric(v)? as i8),
        (ScalarKind::Short, v) => Value::Short(numeric(v)? as i16),
        (ScalarKind::Int, v) => Value::Int(numeric(v)? as i32),
        (ScalarKind::Long, v) => Value::Long(numeric(v)? as i64),
        (ScalarKind::Float, v) => Value::Float(numeric(v)? as f32),
        (ScalarKind::Double, v) => Value::Double(numeric(v)?),
        (kind, v) => {
            return Err(ClientError::UsageError(format!(
                "cannot store {v:?} into a {kind:?} field"
            )))
        }
    };
    Ok(converted)
}

fn numeric(value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        ClientError::UsageError(format!("{value:?} is not numeric"))
    })
}

impl ClientChannel {
    /// Block and retrieve the current value.
    ///
    /// On timeout the underlying operation is cancelled before the error
    /// is returned.
    pub fn get(&self, timeout: Duration, request: PvRequest) -> Result<Value> {
        let waiter = Arc::new(GetWait {
            common: WaitCommon::new(),
        });
        let callback: Arc<dyn GetCallback> = waiter.clone();
        let operation = self.get_with(&callback, request);
        match waiter.common.wait(timeout) {
            Ok(GetEvent::Success(value)) => Ok(value),
            Ok(GetEvent::Fail(message)) => Err(ClientError::RemoteError(message)),
            Ok(GetEvent::Cancel) => Err(ClientError::Cancelled),
            Err(e) => {
                operation.cancel();
                Err(e)
            }
        }
    }

    /// Put to the `value` sub-field and block until confirmed.
    ///
    /// Accepts any scalar [`Value`]; numeric kinds are converted to the
    /// server's field type, a non-scalar target is a usage error.
    pub fn put_value(&self, value: Value, timeout: Duration, request: PvRequest) -> Result<()> {
        let waiter = Arc::new(PutValueWait {
            common: WaitCommon::new(),
            value,
        });
        let callback: Arc<dyn PutCallback> = waiter.clone();
        let operation = self.put_with(&callback, request);
        match waiter.common.wait(timeout) {
            Ok(PutEvent::Success) => Ok(()),
            Ok(PutEvent::Fail(message)) => Err(ClientError::RemoteError(message)),
            Ok(PutEvent::Cancel) => Err(ClientError::Cancelled),
            Err(e) => {
                operation.cancel();
                Err(e)
            }
        }
    }

    /// Block and execute a remote call.
    pub fn rpc(&self, arguments: Value, timeout: Duration, request: PvRequest) -> Result<Value> {
        let waiter = Arc::new(GetWait {
            common: WaitCommon::new(),
        });
        let callback: Arc<dyn GetCallback> = waiter.clone();
        let operation = self.rpc_with(&callback, arguments, request);
        match waiter.common.wait(timeout) {
            Ok(GetEvent::Success(value)) => Ok(value),
            Ok(GetEvent::Fail(message)) => Err(ClientError::RemoteError(message)),
            Ok(GetEvent::Cancel) => Err(ClientError::Cancelled),
            Err(e) => {
                operation.cancel();
                Err(e)
            }
        }
    }

    /// Begin a subscription usable without callbacks.
    ///
    /// Pass a shared event to multiplex several subscriptions through one
    /// waiter (test each with [`MonitorSync::poll`]); with `None` a
    /// private event is allocated for use with [`MonitorSync::wait`].
    pub fn monitor_sync(
        &self,
        request: PvRequest,
        event: Option<Arc<SyncEvent>>,
    ) -> MonitorSync {
        let state = Arc::new(SyncMonitorState {
            event: event.unwrap_or_default(),
            last: Mutex::new(None),
        });
        let callback: Arc<dyn MonitorCallback> = state.clone();
        let monitor = self.monitor_with(&callback, request);
        MonitorSync {
            monitor,
            state,
            event: MonitorEvent::Fail("no event yet".into()),
        }
    }
}

struct SyncMonitorState {
    event: Arc<SyncEvent>,
    last: Mutex<Option<MonitorEvent>>,
}

impl MonitorCallback for SyncMonitorState {
    fn monitor_event(&self, event: &MonitorEvent) {
        *self.last.lock() = Some(event.clone());
        self.event.signal();
    }
}

/// Subscription usable without callbacks.
///
/// Basic usage is `wait`; when it returns true, [`MonitorSync::event`]
/// holds the new event, and for `Data` events [`MonitorSync::monitor`]
/// gives access to `poll`.
pub struct MonitorSync {
    monitor: Monitor,
    state: Arc<SyncMonitorState>,
    /// Most recent event; updated only during `wait` or `poll`.
    event: MonitorEvent,
}

impl MonitorSync {
    /// Check for a new event without blocking.
    pub fn poll(&mut self) -> bool {
        match self.state.last.lock().take() {
            Some(event) => {
                self.event = event;
                true
            }
            None => false,
        }
    }

    /// Wait for a new event; `false` on timeout.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if !self.state.event.wait(timeout) {
            return false;
        }
        self.poll()
    }

    /// Abort one call to `wait`: the waiter observes a synthetic failure
    /// event.
    pub fn wake(&self) {
        *self.state.last.lock() = Some(MonitorEvent::Fail("wakeup".into()));
        self.state.event.signal();
    }

    /// Most recent event observed by `wait`/`poll`.
    pub fn event(&self) -> &MonitorEvent {
        &self.event
    }

    /// The underlying subscription (for `poll`ing elements, `cancel`,
    /// `complete`).
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_event_consumes_signal() {
        let event = SyncEvent::new();
        event.signal();
        assert!(event.wait(Duration::from_millis(1)));
        // Signal was consumed; the next wait times out.
        assert!(!event.wait(Duration::from_millis(1)));
    }

    #[test]
    fn wait_common_times_out_then_completes() {
        let holder: WaitCommon<PutEvent> = WaitCommon::new();
        assert!(matches!(
            holder.wait(Duration::from_millis(5)),
            Err(ClientError::Timeout)
        ));
        holder.complete(PutEvent::Success);
        assert!(matches!(
            holder.wait(Duration::from_millis(5)),
            Ok(PutEvent::Success)
        ));
    }

    #[test]
    fn scalar_conversion_rules() {
        let double = FieldDesc::Scalar(ScalarKind::Double);
        assert_eq!(
            convert_to(&Value::Int(5), &double).unwrap(),
            Value::Double(5.0)
        );
        assert_eq!(
            convert_to(&Value::Double(1.23), &double).unwrap(),
            Value::Double(1.23)
        );
        // Strings do not silently convert to numbers.
        assert!(convert_to(&Value::Str("5".into()), &double).is_err());
        // A structured target (e.g. an enumeration) is a usage error.
        let enum_like = FieldDesc::Structure {
            type_id: "enum_t".into(),
            fields: vec![(
                "index".into(),
                FieldDesc::Scalar(ScalarKind::Int),
            )],
        };
        assert!(matches!(
            convert_to(&Value::Int(1), &enum_like),
            Err(ClientError::UsageError(_))
        ));
    }
}
