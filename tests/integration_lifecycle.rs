//! Channel lifecycle: listener notifications across disconnects, cache
//! management, and type introspection.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{wait_until, MockServer};
use pva_client::{
    ChannelOptions, ClientProvider, ConnectEvent, ConnectListener, FieldDesc, GetFieldCallback,
    PvRequest, ScalarKind, Value,
};

#[derive(Default)]
struct Events {
    log: Mutex<Vec<bool>>,
}

impl ConnectListener for Events {
    fn connect_event(&self, event: &ConnectEvent) {
        self.log.lock().unwrap().push(event.connected);
    }
}

#[test]
fn listeners_observe_disconnect_and_reconnect() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("blinker", Value::Double(1.0))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("blinker")?;
    let events: Arc<Events> = Arc::new(Events::default());
    let as_listener: Arc<dyn ConnectListener> = events.clone();
    channel.add_connect_listener(&as_listener);

    assert!(wait_until(Duration::from_secs(3), || channel.is_connected()));
    server.kill_connections();
    assert!(wait_until(Duration::from_secs(5), || {
        events.log.lock().unwrap().contains(&false)
    }));
    // The mock is still alive, so the channel finds it again.
    assert!(wait_until(Duration::from_secs(10), || channel.is_connected()));

    let log = events.log.lock().unwrap().clone();
    let first_down = log.iter().position(|c| !*c).expect("saw a disconnect");
    assert!(log[..first_down].contains(&true), "connected before the drop");
    assert!(log[first_down..].contains(&true), "reconnected after the drop");
    Ok(())
}

#[test]
fn get_field_reports_channel_type() -> anyhow::Result<()> {
    struct FieldSink {
        result: Mutex<Option<FieldDesc>>,
    }
    impl GetFieldCallback for FieldSink {
        fn get_field_done(&self, result: pva_client::Result<FieldDesc>) {
            *self.result.lock().unwrap() = result.ok();
        }
    }

    let server = MockServer::start(vec![("typed", Value::Double(0.5))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("typed")?;

    let sink = Arc::new(FieldSink {
        result: Mutex::new(None),
    });
    let callback: Arc<dyn GetFieldCallback> = sink.clone();
    let _op = channel.get_field_with(&callback, "");

    assert!(wait_until(Duration::from_secs(3), || {
        sink.result.lock().unwrap().is_some()
    }));
    let desc = sink.result.lock().unwrap().clone().unwrap();
    assert_eq!(
        desc.field("value"),
        Some(&FieldDesc::Scalar(ScalarKind::Double))
    );
    Ok(())
}

#[test]
fn disconnect_drops_cache_entries() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("cached", Value::Double(3.0))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("cached")?;
    assert!(wait_until(Duration::from_secs(3), || channel.is_connected()));

    assert!(provider.disconnect("cached", ChannelOptions::default()));
    assert!(!provider.disconnect("cached", ChannelOptions::default()));

    // A fresh connect builds a new channel that works again.
    let again = provider.connect("cached")?;
    let value = again.get(Duration::from_secs(3), PvRequest::default())?;
    assert_eq!(value.field("value"), Some(&Value::Double(3.0)));

    provider.disconnect_all();
    Ok(())
}

#[test]
fn monitor_sync_waits_and_wakes() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("sy", Value::Double(0.0))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("sy")?;

    let mut sub = channel.monitor_sync(PvRequest::default(), None);
    assert!(sub.wait(Duration::from_secs(3)), "initial update arrives");
    assert!(matches!(sub.event(), pva_client::MonitorEvent::Data));
    let element = sub.monitor().poll().expect("element");
    assert_eq!(element.value.field("value"), Some(&Value::Double(0.0)));
    drop(element);

    // Nothing pending: wait times out.
    assert!(!sub.wait(Duration::from_millis(100)));

    // wake() aborts a blocked waiter with a synthetic failure event.
    sub.wake();
    assert!(sub.wait(Duration::from_millis(500)));
    assert!(matches!(sub.event(), pva_client::MonitorEvent::Fail(_)));
    Ok(())
}
