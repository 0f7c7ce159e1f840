//! End-to-end get/put/rpc against a mock server on loopback.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{wait_until, MockServer};
use pva_client::{
    ClientError, ClientProvider, ConnectEvent, ConnectListener, PvRequest, Value,
};

struct Listener {
    events: Mutex<Vec<bool>>,
}

impl Listener {
    fn new() -> Arc<Listener> {
        Arc::new(Listener {
            events: Mutex::new(Vec::new()),
        })
    }

    fn connected_count(&self) -> usize {
        self.events.lock().unwrap().iter().filter(|c| **c).count()
    }
}

impl ConnectListener for Listener {
    fn connect_event(&self, event: &ConnectEvent) {
        self.events.lock().unwrap().push(event.connected);
    }
}

#[test]
fn basic_get_returns_server_value() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("testScalar", Value::Double(1.23))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("testScalar")?;

    let listener = Listener::new();
    let as_listener: Arc<dyn ConnectListener> = listener.clone();
    channel.add_connect_listener(&as_listener);

    let value = channel.get(Duration::from_secs(3), PvRequest::default())?;
    assert_eq!(value.field("value"), Some(&Value::Double(1.23)));
    assert!(channel.is_connected());
    assert!(listener.connected_count() >= 1);
    Ok(())
}

#[test]
fn put_then_get_round_trips() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("counter", Value::Double(0.0))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("counter")?;

    channel.put_value(
        Value::Double(5.0),
        Duration::from_secs(3),
        PvRequest::default(),
    )?;
    let value = channel.get(Duration::from_secs(3), PvRequest::default())?;
    assert_eq!(value.field("value"), Some(&Value::Double(5.0)));
    assert_eq!(server.value_of("counter"), Some(Value::Double(5.0)));

    // Integer input converts onto the double field.
    channel.put_value(
        Value::Int(7),
        Duration::from_secs(3),
        PvRequest::default(),
    )?;
    assert!(wait_until(Duration::from_secs(2), || {
        server.value_of("counter") == Some(Value::Double(7.0))
    }));
    Ok(())
}

#[test]
fn timed_out_put_cancels_and_late_ack_is_ignored() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("slow", Value::Double(0.0))]);
    server.delay_put_acks(Duration::from_millis(1500));
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("slow")?;

    // Wait for the channel first so the put timeout is not spent
    // connecting.
    assert!(wait_until(Duration::from_secs(3), || channel.is_connected()));

    let started = std::time::Instant::now();
    let err = channel
        .put_value(
            Value::Double(5.0),
            Duration::from_millis(500),
            PvRequest::default(),
        )
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout));
    assert!(started.elapsed() < Duration::from_millis(1400));

    // The server acknowledges later; the cancelled operation must stay
    // silent, and the channel must remain usable.
    std::thread::sleep(Duration::from_millis(1500));
    let value = channel.get(Duration::from_secs(3), PvRequest::default())?;
    assert_eq!(value.field("value"), Some(&Value::Double(5.0)));
    Ok(())
}

#[test]
fn rpc_round_trips_arguments() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("sum", Value::Double(0.0))]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let channel = provider.connect("sum")?;

    let arguments = Value::Structure(vec![
        ("a".to_string(), Value::Double(1.5)),
        ("b".to_string(), Value::Int(2)),
        ("tag".to_string(), Value::Str("query".to_string())),
    ]);
    let result = channel.rpc(
        arguments.clone(),
        Duration::from_secs(3),
        PvRequest::default(),
    )?;
    assert_eq!(result, arguments);
    Ok(())
}

#[test]
fn missing_channel_times_out_and_unknown_provider_errors() {
    let server = MockServer::start(vec![("present", Value::Double(1.0))]);
    let provider = ClientProvider::new("pva", server.client_config()).expect("provider");
    let channel = provider.connect("absent").expect("channel handle");
    let err = channel
        .get(Duration::from_millis(300), PvRequest::default())
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout));

    let err = ClientProvider::new("no-such-provider", server.client_config()).unwrap_err();
    assert!(matches!(err, ClientError::UsageError(_)));
}
