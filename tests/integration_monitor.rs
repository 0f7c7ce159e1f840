//! End-to-end monitor behavior: update delivery, overrun coalescing,
//! disconnect/resubscribe, and unlisten.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{wait_until, MockServer};
use pva_client::{
    ClientProvider, MonitorCallback, MonitorEvent, PvRequest, Value,
};

/// Records the event stream as compact tags for sequence assertions.
struct Recorder {
    events: Mutex<Vec<&'static str>>,
}

impl Recorder {
    fn new() -> Arc<Recorder> {
        Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        })
    }

    fn tags(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, tag: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|&&t| t == tag)
            .count()
    }
}

impl MonitorCallback for Recorder {
    fn monitor_event(&self, event: &MonitorEvent) {
        let tag = match event {
            MonitorEvent::Data => "data",
            MonitorEvent::Disconnect => "disconnect",
            MonitorEvent::Cancel => "cancel",
            MonitorEvent::Fail(_) => "fail",
        };
        self.events.lock().unwrap().push(tag);
    }
}

#[test]
fn monitor_delivers_updates_in_order() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("ticker", Value::Double(0.0))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("ticker")?;

    let recorder = Recorder::new();
    let callback: Arc<dyn MonitorCallback> = recorder.clone();
    let monitor = channel.monitor_with(&callback, PvRequest::parse("record[queueSize=8]field()")?);

    // Initial update arrives on start.
    assert!(wait_until(Duration::from_secs(3), || recorder.count("data") >= 1));
    server.push_update("ticker", Value::Double(1.0));
    server.push_update("ticker", Value::Double(2.0));
    assert!(wait_until(Duration::from_secs(3), || recorder.count("data") >= 3));

    let first = monitor.poll().expect("initial element");
    assert_eq!(first.value.field("value"), Some(&Value::Double(0.0)));
    let second = monitor.poll().expect("second element");
    assert_eq!(second.value.field("value"), Some(&Value::Double(1.0)));
    let third = monitor.poll().expect("third element");
    assert_eq!(third.value.field("value"), Some(&Value::Double(2.0)));
    assert!(third.overrun.is_empty());
    assert!(monitor.poll().is_none());
    Ok(())
}

#[test]
fn overrun_coalesces_into_newest_slot() -> anyhow::Result<()> {
    // Two fields so the change bits tell updates apart: bit 1 is `value`,
    // bit 2 is `count`.
    let server = MockServer::start(vec![(
        "burst",
        Value::Structure(vec![
            ("value".to_string(), Value::Double(0.0)),
            ("count".to_string(), Value::Int(0)),
        ]),
    )]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("burst")?;

    let recorder = Recorder::new();
    let callback: Arc<dyn MonitorCallback> = recorder.clone();
    // Default queue size is 2.
    let monitor = channel.monitor_with(&callback, PvRequest::default());

    // Drain the initial snapshot so the bursts start on an empty queue.
    assert!(wait_until(Duration::from_secs(3), || recorder.count("data") >= 1));
    let initial = monitor.poll().expect("initial snapshot");
    assert!(initial.changed.get(0));
    drop(initial);

    // Five bursts before any further poll: the first two fill the queue,
    // the remaining three coalesce into the newest slot.
    server.push_field_update("burst", "value", Value::Double(1.0));
    server.push_field_update("burst", "count", Value::Int(10));
    server.push_field_update("burst", "count", Value::Int(20));
    server.push_field_update("burst", "count", Value::Int(30));
    server.push_field_update("burst", "value", Value::Double(5.0));
    assert!(wait_until(Duration::from_secs(3), || recorder.count("data") >= 6));

    // First element carries update 1 alone, untouched by the coalescing
    // happening behind it.
    let first = monitor.poll().expect("first element");
    assert_eq!(first.value.field("value"), Some(&Value::Double(1.0)));
    assert_eq!(first.value.field("count"), Some(&Value::Int(0)));
    assert!(first.changed.get(1));
    assert!(!first.changed.get(0) && !first.changed.get(2));
    assert!(first.overrun.is_empty());

    // Second element absorbed updates 2..=5. The latest data for both
    // fields survives; the intermediate count writes (10, 20) were
    // overwritten unseen so bit 2 accumulates as overrun, while the final
    // value write was delivered as the current data and stays a plain
    // change.
    let second = monitor.poll().expect("coalesced element");
    assert_eq!(second.value.field("value"), Some(&Value::Double(5.0)));
    assert_eq!(second.value.field("count"), Some(&Value::Int(30)));
    assert!(second.changed.get(1) && second.changed.get(2));
    assert!(!second.changed.get(0));
    assert!(second.overrun.get(2), "overwritten count bits accumulate");
    assert!(
        !second.overrun.get(1),
        "a write delivered as current data is not an overrun"
    );
    assert!(!second.overrun.get(0));
    assert!(monitor.poll().is_none());
    Ok(())
}

#[test]
fn disconnect_mid_monitor_resubscribes_after_recovery() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("feed", Value::Double(0.0))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("feed")?;

    let recorder = Recorder::new();
    let callback: Arc<dyn MonitorCallback> = recorder.clone();
    let monitor = channel.monitor_with(&callback, PvRequest::parse("record[queueSize=8]field()")?);

    assert!(wait_until(Duration::from_secs(3), || recorder.count("data") >= 1));
    server.push_update("feed", Value::Double(1.0));
    server.push_update("feed", Value::Double(2.0));
    assert!(wait_until(Duration::from_secs(3), || recorder.count("data") >= 3));

    // Kill the TCP circuit: the observer sees Data, Data, Data,
    // Disconnect.
    server.kill_connections();
    assert!(wait_until(Duration::from_secs(5), || recorder.count("disconnect") >= 1));
    let tags = recorder.tags();
    assert_eq!(tags[..4], ["data", "data", "data", "disconnect"]);

    // The client re-searches, reconnects and resubscribes on its own; the
    // next event is Data again (the fresh initial snapshot).
    assert!(wait_until(Duration::from_secs(10), || recorder.count("data") >= 4));
    let tags = recorder.tags();
    let after_disconnect = &tags[tags.iter().position(|t| *t == "disconnect").unwrap() + 1..];
    assert!(after_disconnect.contains(&"data"));
    assert!(!after_disconnect.contains(&"fail"));

    drop(monitor);
    Ok(())
}

#[test]
fn unlisten_completes_after_drain() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("finite", Value::Double(9.0))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("finite")?;

    let recorder = Recorder::new();
    let callback: Arc<dyn MonitorCallback> = recorder.clone();
    let monitor = channel.monitor_with(&callback, PvRequest::default());

    assert!(wait_until(Duration::from_secs(3), || recorder.count("data") >= 1));
    assert!(!monitor.complete());
    server.unlisten("finite");

    // Complete only once the queue is drained.
    assert!(wait_until(Duration::from_secs(3), || {
        while monitor.poll().is_some() {}
        monitor.complete()
    }));
    Ok(())
}

#[test]
fn cancel_is_idempotent_and_drains() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("c", Value::Double(0.0))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("c")?;

    let recorder = Recorder::new();
    let callback: Arc<dyn MonitorCallback> = recorder.clone();
    let monitor = channel.monitor_with(&callback, PvRequest::default());
    assert!(wait_until(Duration::from_secs(3), || recorder.count("data") >= 1));

    monitor.cancel();
    assert!(monitor.poll().is_none(), "cancel drains the queue");
    monitor.cancel();
    monitor.cancel();
    assert_eq!(recorder.count("cancel"), 1, "exactly one terminal event");
    Ok(())
}
