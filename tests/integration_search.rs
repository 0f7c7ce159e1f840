//! Discovery behavior: duplicate search responses and fixed-address
//! channels.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{wait_until, MockServer};
use pva_client::{
    ChannelOptions, ClientProvider, ConnectEvent, ConnectListener, PvRequest, Value,
};

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<String>>,
    connects: Mutex<usize>,
}

impl ConnectListener for Recorder {
    fn connect_event(&self, event: &ConnectEvent) {
        if event.connected {
            *self.connects.lock().unwrap() += 1;
        }
    }

    fn message(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}

#[test]
fn duplicate_search_response_keeps_first_binding_and_warns_once() -> anyhow::Result<()> {
    // Two independent servers both host the same channel name.
    let first = MockServer::start_with_guid(
        vec![("shared", Value::Double(1.0))],
        *b"server-one!!",
    );
    let second = MockServer::start_with_guid(
        vec![("shared", Value::Double(2.0))],
        *b"server-two!!",
    );

    let mut config = first.client_config();
    config.addr_list = format!(
        "127.0.0.1:{} 127.0.0.1:{}",
        first.udp_addr.port(),
        second.udp_addr.port()
    );
    let provider = ClientProvider::new("pva", config)?;
    let channel = provider.connect("shared")?;
    let recorder: Arc<Recorder> = Arc::new(Recorder::default());
    let as_listener: Arc<dyn ConnectListener> = recorder.clone();
    channel.add_connect_listener(&as_listener);

    // Both servers claim the CID; the first binding is kept and the
    // second responder produces exactly one warning naming its address.
    assert!(wait_until(Duration::from_secs(5), || channel.is_connected()));
    assert!(wait_until(Duration::from_secs(2), || {
        !recorder.messages.lock().unwrap().is_empty()
    }));
    std::thread::sleep(Duration::from_millis(300));

    let messages = recorder.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1, "exactly one warning, got {messages:?}");
    let tcp_ports = [first.tcp_addr.port(), second.tcp_addr.port()];
    assert!(
        tcp_ports.iter().any(|p| messages[0].contains(&p.to_string())),
        "warning names the losing server: {}",
        messages[0]
    );

    // The channel still works against whichever server won.
    let value = channel.get(Duration::from_secs(3), PvRequest::default())?;
    let v = value.field("value").and_then(|v| v.as_f64()).unwrap();
    assert!(v == 1.0 || v == 2.0);
    Ok(())
}

#[test]
fn fixed_address_channel_skips_search() -> anyhow::Result<()> {
    let server = MockServer::start(vec![("direct", Value::Double(4.2))]);
    // No usable search targets at all: only the fixed address can work.
    let mut config = server.client_config();
    config.addr_list = String::new();
    config.auto_addr_list = false;

    let provider = ClientProvider::new("pva", config)?;
    let channel = provider.connect_with(
        "direct",
        ChannelOptions {
            priority: 0,
            address: Some(format!("127.0.0.1:{}", server.tcp_addr.port())),
        },
    )?;
    let value = channel.get(Duration::from_secs(3), PvRequest::default())?;
    assert_eq!(value.field("value"), Some(&Value::Double(4.2)));
    Ok(())
}

#[test]
fn channels_share_one_circuit_per_priority() -> anyhow::Result<()> {
    let server = MockServer::start(vec![
        ("a", Value::Double(1.0)),
        ("b", Value::Double(2.0)),
    ]);
    let provider = ClientProvider::new("pva", server.client_config())?;
    let a = provider.connect("a")?;
    let b = provider.connect("b")?;

    assert_eq!(
        a.get(Duration::from_secs(3), PvRequest::default())?
            .field("value"),
        Some(&Value::Double(1.0))
    );
    assert_eq!(
        b.get(Duration::from_secs(3), PvRequest::default())?
            .field("value"),
        Some(&Value::Double(2.0))
    );

    // Same cache entry for the same (name, options) pair.
    let a_again = provider.connect("a")?;
    assert!(a_again.is_connected());
    Ok(())
}
