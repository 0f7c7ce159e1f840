//! In-process mock PVA server used by the integration tests.
//!
//! Speaks just enough of the protocol over real loopback sockets to
//! exercise the client end-to-end: UDP search, the TCP verification
//! handshake, channel creation, get/put/rpc/get-field, and monitors with
//! test-driven pushes, unlisten and forced disconnects.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pva_client::introspection::IntrospectionRegistry;
use pva_client::pvdata::{BitSet, Value};
use pva_client::wire::{
    cmd, put_inet_addr, subcmd, ByteBuf, ByteOrder, Header, SegmentPos, Status, HEADER_LEN,
};
use pva_client::ClientConfig;

/// Route crate logs through the test harness; `RUST_LOG` controls detail.
pub fn init_tracing() {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct MockServer {
    pub udp_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    state: Arc<State>,
}

struct State {
    guid: [u8; 12],
    tcp_port: u16,
    channels: Mutex<HashMap<String, Value>>,
    put_ack_delay: Mutex<Option<Duration>>,
    running: AtomicBool,
    next_sid: AtomicU32,
    monitors: Mutex<Vec<MonitorSub>>,
    conns: Mutex<Vec<Arc<Conn>>>,
}

struct Conn {
    writer: Mutex<TcpStream>,
    out_ir: Mutex<IntrospectionRegistry>,
    in_ir: Mutex<IntrospectionRegistry>,
    sids: Mutex<HashMap<u32, String>>,
    alive: AtomicBool,
}

struct MonitorSub {
    conn: Arc<Conn>,
    ioid: u32,
    name: String,
}

impl MockServer {
    /// Start a server hosting the given channels. A structure value is
    /// hosted as-is; anything else becomes the `value` field of a
    /// single-field structure.
    pub fn start(channels: Vec<(&str, Value)>) -> MockServer {
        Self::start_with_guid(channels, *b"mock-server!")
    }

    pub fn start_with_guid(channels: Vec<(&str, Value)>, guid: [u8; 12]) -> MockServer {
        init_tracing();
        let udp = UdpSocket::bind("127.0.0.1:0").expect("bind mock udp");
        udp.set_read_timeout(Some(Duration::from_millis(50)))
            .expect("udp timeout");
        let tcp = TcpListener::bind("127.0.0.1:0").expect("bind mock tcp");
        tcp.set_nonblocking(true).expect("tcp nonblocking");
        let udp_addr = udp.local_addr().expect("udp addr");
        let tcp_addr = tcp.local_addr().expect("tcp addr");

        let mut table = HashMap::new();
        for (name, value) in channels {
            let stored = match value {
                structured @ Value::Structure(_) => structured,
                scalar => Value::Structure(vec![("value".to_string(), scalar)]),
            };
            table.insert(name.to_string(), stored);
        }
        let state = Arc::new(State {
            guid,
            tcp_port: tcp_addr.port(),
            channels: Mutex::new(table),
            put_ack_delay: Mutex::new(None),
            running: AtomicBool::new(true),
            next_sid: AtomicU32::new(1),
            monitors: Mutex::new(Vec::new()),
            conns: Mutex::new(Vec::new()),
        });

        {
            let state = state.clone();
            std::thread::spawn(move || udp_loop(udp, state));
        }
        {
            let state = state.clone();
            std::thread::spawn(move || accept_loop(tcp, state));
        }
        MockServer {
            udp_addr,
            tcp_addr,
            state,
        }
    }

    /// Client configuration pointed at this server only.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            addr_list: format!("127.0.0.1:{}", self.udp_addr.port()),
            auto_addr_list: false,
            connection_timeout: Duration::from_secs(5),
            beacon_period: Duration::from_secs(1),
            ..ClientConfig::default()
        }
    }

    /// Delay put acknowledgements; the ack still arrives eventually.
    pub fn delay_put_acks(&self, delay: Duration) {
        *self.state.put_ack_delay.lock().unwrap() = Some(delay);
    }

    /// Store a new `value` field and push it to every matching monitor.
    pub fn push_update(&self, name: &str, value: Value) {
        self.push_field_update(name, "value", value);
    }

    /// Store a new value for one named field and push that delta (its
    /// change bit only) to every matching monitor.
    pub fn push_field_update(&self, name: &str, field: &str, value: Value) {
        let (field_bytes, changed) = {
            let mut channels = self.state.channels.lock().unwrap();
            let stored = channels.get_mut(name).expect("unknown channel");
            let desc = stored.infer_desc();
            let index = desc.field_index(field).expect("unknown field");
            if let Value::Structure(fields) = stored {
                fields[index].1 = value;
            }
            let changed = BitSet::with_bit(index + 1);
            let mut buf = ByteBuf::new(ByteOrder::Little);
            stored
                .encode_masked(&desc, &changed, &mut buf)
                .expect("encode update");
            (buf.into_vec(), changed)
        };
        let monitors = self.state.monitors.lock().unwrap();
        for sub in monitors.iter().filter(|s| s.name == name) {
            let ioid = sub.ioid;
            let field_bytes = field_bytes.clone();
            let changed = changed.clone();
            send_app(&sub.conn, cmd::MONITOR, |payload, _| {
                payload.put_u32(ioid);
                payload.put_u8(subcmd::DEFAULT);
                changed.encode(payload);
                payload.put_slice(&field_bytes);
                BitSet::new().encode(payload);
            });
        }
    }

    /// Tell every matching monitor the source has closed.
    pub fn unlisten(&self, name: &str) {
        let monitors = self.state.monitors.lock().unwrap();
        for sub in monitors.iter().filter(|s| s.name == name) {
            let ioid = sub.ioid;
            send_app(&sub.conn, cmd::MONITOR, |payload, _| {
                payload.put_u32(ioid);
                payload.put_u8(subcmd::UNLISTEN);
            });
        }
    }

    /// Current `value` field of a hosted channel.
    pub fn value_of(&self, name: &str) -> Option<Value> {
        self.state
            .channels
            .lock()
            .unwrap()
            .get(name)
            .and_then(|v| v.field("value").cloned())
    }

    /// Hard-close every TCP connection, as if the server died.
    pub fn kill_connections(&self) {
        let conns: Vec<Arc<Conn>> = self.state.conns.lock().unwrap().drain(..).collect();
        self.state.monitors.lock().unwrap().clear();
        for conn in conns {
            conn.alive.store(false, Ordering::Release);
            let _ = conn.writer.lock().unwrap().shutdown(Shutdown::Both);
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        self.kill_connections();
    }
}

fn send_app<F>(conn: &Arc<Conn>, command: u8, build: F)
where
    F: FnOnce(&mut ByteBuf, &mut IntrospectionRegistry),
{
    if !conn.alive.load(Ordering::Acquire) {
        return;
    }
    let mut payload = ByteBuf::new(ByteOrder::Little);
    {
        let mut out_ir = conn.out_ir.lock().unwrap();
        build(&mut payload, &mut out_ir);
    }
    let mut header = Header::application(command, SegmentPos::None, payload.len() as u32);
    header.from_server = true;
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(payload.as_slice());
    let mut writer = conn.writer.lock().unwrap();
    let _ = writer.write_all(&frame);
}

fn udp_loop(udp: UdpSocket, state: Arc<State>) {
    let mut buf = [0u8; 65535];
    while state.running.load(Ordering::Acquire) {
        let (n, from) = match udp.recv_from(&mut buf) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if n < HEADER_LEN {
            continue;
        }
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buf[..HEADER_LEN]);
        let Ok(header) = Header::decode(&raw) else { continue };
        if header.command != cmd::SEARCH_REQUEST {
            continue;
        }
        let mut payload =
            ByteBuf::from_vec(buf[HEADER_LEN..n].to_vec(), header.order);
        let Ok(claimed) = parse_search(&mut payload, &state) else { continue };
        let (sequence_id, cids) = claimed;
        if cids.is_empty() {
            continue;
        }

        let mut reply = ByteBuf::new(ByteOrder::Little);
        reply.put_slice(&state.guid);
        reply.put_u32(sequence_id);
        reply.put_u8(1);
        put_inet_addr(&mut reply, Some("127.0.0.1".parse().unwrap()));
        reply.put_u16(state.tcp_port);
        reply.put_u16(cids.len() as u16);
        for cid in &cids {
            reply.put_u32(*cid);
        }
        let mut header =
            Header::application(cmd::SEARCH_RESPONSE, SegmentPos::None, reply.len() as u32);
        header.from_server = true;
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(reply.as_slice());
        let _ = udp.send_to(&frame, from);
    }
}

fn parse_search(
    payload: &mut ByteBuf,
    state: &State,
) -> Result<(u32, Vec<u32>), pva_client::ClientError> {
    let sequence_id = payload.get_u32()?;
    let _flags = payload.get_u8()?;
    payload.skip(3)?;
    payload.skip(16)?;
    let _response_port = payload.get_u16()?;
    let protocol_count = payload.get_size()?;
    for _ in 0..protocol_count {
        let _ = payload.get_string()?;
    }
    let count = payload.get_u16()?;
    let channels = state.channels.lock().unwrap();
    let mut cids = Vec::new();
    for _ in 0..count {
        let cid = payload.get_u32()?;
        let name = payload.get_string()?;
        if channels.contains_key(&name) {
            cids.push(cid);
        }
    }
    Ok((sequence_id, cids))
}

fn accept_loop(listener: TcpListener, state: Arc<State>) {
    while state.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                // The listener is non-blocking; the per-connection
                // threads want blocking reads.
                stream.set_nonblocking(false).expect("blocking stream");
                let writer = stream.try_clone().expect("clone stream");
                let conn = Arc::new(Conn {
                    writer: Mutex::new(writer),
                    out_ir: Mutex::new(IntrospectionRegistry::new()),
                    in_ir: Mutex::new(IntrospectionRegistry::new()),
                    sids: Mutex::new(HashMap::new()),
                    alive: AtomicBool::new(true),
                });
                state.conns.lock().unwrap().push(conn.clone());
                let state = state.clone();
                std::thread::spawn(move || conn_loop(stream, conn, state));
            }
            Err(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    }
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<(Header, ByteBuf)> {
    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw)?;
    let header = Header::decode(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    if header.control {
        return Ok((header, ByteBuf::new(ByteOrder::Little)));
    }
    let mut payload = vec![0u8; header.payload_size as usize];
    stream.read_exact(&mut payload)?;
    Ok((header, ByteBuf::from_vec(payload, header.order)))
}

fn conn_loop(mut stream: TcpStream, conn: Arc<Conn>, state: Arc<State>) {
    // Verification handshake, server side.
    send_app(&conn, cmd::CONNECTION_VALIDATION, |payload, _| {
        payload.put_u32(32 * 1024);
        payload.put_u16(0x7FFF);
        payload.put_size(1);
        payload.put_string("anonymous");
    });

    while state.running.load(Ordering::Acquire) && conn.alive.load(Ordering::Acquire) {
        let (header, mut payload) = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(_) => break,
        };
        if header.control {
            continue;
        }
        if handle_app(&conn, &state, header.command, &mut payload).is_err() {
            break;
        }
    }
    conn.alive.store(false, Ordering::Release);
    state
        .monitors
        .lock()
        .unwrap()
        .retain(|sub| !Arc::ptr_eq(&sub.conn, &conn));
}

fn handle_app(
    conn: &Arc<Conn>,
    state: &Arc<State>,
    command: u8,
    payload: &mut ByteBuf,
) -> Result<(), pva_client::ClientError> {
    match command {
        cmd::CONNECTION_VALIDATION => {
            send_app(conn, cmd::CONNECTION_VALIDATED, |reply, _| {
                Status::Ok.encode(reply);
            });
        }
        cmd::CREATE_CHANNEL => {
            let _count = payload.get_u16()?;
            let cid = payload.get_u32()?;
            let name = payload.get_string()?;
            if state.channels.lock().unwrap().contains_key(&name) {
                let sid = state.next_sid.fetch_add(1, Ordering::Relaxed);
                conn.sids.lock().unwrap().insert(sid, name);
                send_app(conn, cmd::CREATE_CHANNEL, |reply, _| {
                    reply.put_u32(cid);
                    reply.put_u32(sid);
                    Status::Ok.encode(reply);
                });
            } else {
                send_app(conn, cmd::CREATE_CHANNEL, |reply, _| {
                    reply.put_u32(cid);
                    reply.put_u32(0);
                    Status::Error(format!("no such channel {name:?}")).encode(reply);
                });
            }
        }
        cmd::GET => {
            let sid = payload.get_u32()?;
            let ioid = payload.get_u32()?;
            let sub = payload.get_u8()?;
            let name = conn.sids.lock().unwrap().get(&sid).cloned();
            let Some(name) = name else { return Ok(()) };
            let stored = state.channels.lock().unwrap().get(&name).cloned();
            let Some(stored) = stored else { return Ok(()) };
            let desc = stored.infer_desc();
            match sub {
                subcmd::INIT => {
                    let _request = payload.get_string()?;
                    send_app(conn, cmd::GET, |reply, out_ir| {
                        reply.put_u32(ioid);
                        reply.put_u8(subcmd::INIT);
                        Status::Ok.encode(reply);
                        out_ir.serialize(&desc, reply);
                    });
                }
                subcmd::GET => {
                    send_app(conn, cmd::GET, |reply, _| {
                        reply.put_u32(ioid);
                        reply.put_u8(subcmd::GET);
                        Status::Ok.encode(reply);
                        BitSet::with_bit(0).encode(reply);
                        stored.encode_full(&desc, reply).expect("encode value");
                    });
                }
                _ => {}
            }
        }
        cmd::PUT => {
            let sid = payload.get_u32()?;
            let ioid = payload.get_u32()?;
            let sub = payload.get_u8()?;
            let name = conn.sids.lock().unwrap().get(&sid).cloned();
            let Some(name) = name else { return Ok(()) };
            match sub {
                subcmd::INIT => {
                    let _request = payload.get_string()?;
                    let stored = state.channels.lock().unwrap().get(&name).cloned();
                    let Some(stored) = stored else { return Ok(()) };
                    let desc = stored.infer_desc();
                    send_app(conn, cmd::PUT, |reply, out_ir| {
                        reply.put_u32(ioid);
                        reply.put_u8(subcmd::INIT);
                        Status::Ok.encode(reply);
                        out_ir.serialize(&desc, reply);
                    });
                }
                subcmd::DEFAULT => {
                    {
                        let mut channels = state.channels.lock().unwrap();
                        if let Some(stored) = channels.get_mut(&name) {
                            let desc = stored.infer_desc();
                            let changed = BitSet::decode(payload)?;
                            stored.apply_masked(&desc, &changed, payload)?;
                        }
                    }
                    let delay = *state.put_ack_delay.lock().unwrap();
                    let conn = conn.clone();
                    let ack = move || {
                        send_app(&conn, cmd::PUT, |reply, _| {
                            reply.put_u32(ioid);
                            reply.put_u8(subcmd::DEFAULT);
                            Status::Ok.encode(reply);
                        });
                    };
                    match delay {
                        Some(delay) => {
                            std::thread::spawn(move || {
                                std::thread::sleep(delay);
                                ack();
                            });
                        }
                        None => ack(),
                    }
                }
                _ => {}
            }
        }
        cmd::RPC => {
            let _sid = payload.get_u32()?;
            let ioid = payload.get_u32()?;
            let sub = payload.get_u8()?;
            match sub {
                subcmd::INIT => {
                    let _request = payload.get_string()?;
                    send_app(conn, cmd::RPC, |reply, _| {
                        reply.put_u32(ioid);
                        reply.put_u8(subcmd::INIT);
                        Status::Ok.encode(reply);
                    });
                }
                subcmd::DEFAULT => {
                    let desc = conn
                        .in_ir
                        .lock()
                        .unwrap()
                        .deserialize(payload)?
                        .expect("rpc argument descriptor");
                    let arguments = Value::decode_full(&desc, payload)?;
                    // Service behavior: echo the arguments back.
                    send_app(conn, cmd::RPC, |reply, out_ir| {
                        reply.put_u32(ioid);
                        reply.put_u8(subcmd::DEFAULT);
                        Status::Ok.encode(reply);
                        out_ir.serialize(&desc, reply);
                        arguments.encode_full(&desc, reply).expect("encode rpc");
                    });
                }
                _ => {}
            }
        }
        cmd::GET_FIELD => {
            let sid = payload.get_u32()?;
            let ioid = payload.get_u32()?;
            let _subfield = payload.get_string()?;
            let name = conn.sids.lock().unwrap().get(&sid).cloned();
            let Some(name) = name else { return Ok(()) };
            let stored = state.channels.lock().unwrap().get(&name).cloned();
            let Some(stored) = stored else { return Ok(()) };
            let desc = stored.infer_desc();
            send_app(conn, cmd::GET_FIELD, |reply, out_ir| {
                reply.put_u32(ioid);
                Status::Ok.encode(reply);
                out_ir.serialize(&desc, reply);
            });
        }
        cmd::MONITOR => {
            let sid = payload.get_u32()?;
            let ioid = payload.get_u32()?;
            let sub = payload.get_u8()?;
            let name = conn.sids.lock().unwrap().get(&sid).cloned();
            let Some(name) = name else { return Ok(()) };
            match sub {
                subcmd::INIT => {
                    let _request = payload.get_string()?;
                    let stored = state.channels.lock().unwrap().get(&name).cloned();
                    let Some(stored) = stored else { return Ok(()) };
                    let desc = stored.infer_desc();
                    send_app(conn, cmd::MONITOR, |reply, out_ir| {
                        reply.put_u32(ioid);
                        reply.put_u8(subcmd::INIT);
                        Status::Ok.encode(reply);
                        out_ir.serialize(&desc, reply);
                    });
                }
                subcmd::START => {
                    state.monitors.lock().unwrap().push(MonitorSub {
                        conn: conn.clone(),
                        ioid,
                        name: name.clone(),
                    });
                    // Initial update: full structure.
                    let stored = state.channels.lock().unwrap().get(&name).cloned();
                    if let Some(stored) = stored {
                        let desc = stored.infer_desc();
                        send_app(conn, cmd::MONITOR, |reply, _| {
                            reply.put_u32(ioid);
                            reply.put_u8(subcmd::DEFAULT);
                            BitSet::with_bit(0).encode(reply);
                            stored.encode_full(&desc, reply).expect("encode initial");
                            BitSet::new().encode(reply);
                        });
                    }
                }
                subcmd::STOP => {
                    state
                        .monitors
                        .lock()
                        .unwrap()
                        .retain(|s| !(Arc::ptr_eq(&s.conn, conn) && s.ioid == ioid));
                }
                _ => {}
            }
        }
        cmd::DESTROY_REQUEST => {
            let _sid = payload.get_u32()?;
            let ioid = payload.get_u32()?;
            state
                .monitors
                .lock()
                .unwrap()
                .retain(|s| !(Arc::ptr_eq(&s.conn, conn) && s.ioid == ioid));
        }
        _ => {}
    }
    Ok(())
}

/// Spin until `predicate` holds or the budget runs out.
pub fn wait_until(budget: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + budget;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
