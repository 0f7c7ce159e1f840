//! # Response Dispatcher
//!
//! Routes every incoming application message by its command byte through a
//! fixed 28-entry handler table. The table is populated at compile time
//! and never mutated, so dispatch itself takes no lock. Entries 0..9 cover
//! connection metadata (beacons, validation, search); entries 10..20 are
//! data responses that look up the in-flight operation by IOID in the
//! originating transport; everything else is logged and skipped by
//! advancing past the payload.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{ClientError, Result};
use crate::provider::ContextInner;
use crate::transport::tcp::TcpTransport;
use crate::wire::{get_inet_addr, ByteBuf, Status};

/// Where a message came from.
#[derive(Clone)]
pub(crate) enum Origin {
    Tcp(Arc<TcpTransport>),
    Udp { from: SocketAddr },
}

impl Origin {
    fn tcp(&self) -> Result<&Arc<TcpTransport>> {
        match self {
            Origin::Tcp(t) => Ok(t),
            Origin::Udp { from } => Err(ClientError::bad_stream(format!(
                "TCP-only command received over UDP from {from}"
            ))),
        }
    }

    fn source(&self) -> SocketAddr {
        match self {
            Origin::Tcp(t) => t.remote(),
            Origin::Udp { from } => *from,
        }
    }
}

type HandlerFn = fn(&Arc<ContextInner>, &Origin, u8, &mut ByteBuf) -> Result<()>;

const HANDLER_COUNT: usize = 28;

/// Command-code handler table; indices are PVA command bytes.
static HANDLERS: [HandlerFn; HANDLER_COUNT] = [
    handle_beacon,               //  0
    handle_validation_request,   //  1
    handle_noop,                 //  2 - echo
    handle_noop,                 //  3 - search request (server side)
    handle_search_response,      //  4
    handle_unsupported,          //  5 - introspection search
    handle_unsupported,          //  6 - introspection search response
    handle_create_channel,       //  7
    handle_destroy_channel,      //  8
    handle_connection_validated, //  9
    handle_data_response,        // 10 - get
    handle_data_response,        // 11 - put
    handle_data_response,        // 12 - put-get
    handle_data_response,        // 13 - monitor
    handle_data_response,        // 14 - array
    handle_cancel_ack,           // 15
    handle_data_response,        // 16 - process
    handle_data_response,        // 17 - get field
    handle_requester_message,    // 18
    handle_unsupported,          // 19 - grouped monitors
    handle_data_response,        // 20 - rpc
    handle_unsupported,          // 21
    handle_unsupported,          // 22
    handle_unsupported,          // 23
    handle_unsupported,          // 24
    handle_unsupported,          // 25
    handle_unsupported,          // 26
    handle_unsupported,          // 27
];

/// Route one application message. Returns an error only for protocol
/// violations that should close the originating transport.
pub(crate) fn dispatch(
    context: &Arc<ContextInner>,
    origin: Origin,
    version: u8,
    command: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let index = command as usize;
    if index >= HANDLER_COUNT {
        warn!(command, from = %origin.source(), "unknown command, skipping payload");
        return Ok(());
    }
    trace!(command, from = %origin.source(), len = payload.remaining(), "dispatch");
    HANDLERS[index](context, &origin, version, payload)
}

fn handle_noop(_: &Arc<ContextInner>, _: &Origin, _: u8, _: &mut ByteBuf) -> Result<()> {
    Ok(())
}

fn handle_unsupported(
    _: &Arc<ContextInner>,
    origin: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    debug!(from = %origin.source(), "unsupported command, skipping payload");
    let rest = payload.remaining();
    payload.skip(rest)?;
    Ok(())
}

/// Periodic server announcement; used for liveness and fast reconnect.
fn handle_beacon(
    context: &Arc<ContextInner>,
    origin: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let mut guid = [0u8; 12];
    guid.copy_from_slice(&payload.get_slice(12)?);
    let sequence = payload.get_u8()?;
    let _change_count = payload.get_u16()?;
    let _address = get_inet_addr(payload)?;
    let _port = payload.get_u16()?;
    context.beacon_received(origin.source(), guid, sequence);
    Ok(())
}

/// Server's half of the verification handshake.
fn handle_validation_request(
    _: &Arc<ContextInner>,
    origin: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let transport = origin.tcp()?;
    let server_buffer_size = payload.get_u32()? as usize;
    let _registry_capacity = payload.get_u16()?;
    let count = payload.get_size()?;
    let mut plugins = Vec::with_capacity(count);
    for _ in 0..count {
        plugins.push(payload.get_string()?);
    }
    transport.handle_validation_request(server_buffer_size, plugins)
}

/// Final handshake verdict; a verified transport may carry channels.
fn handle_connection_validated(
    _: &Arc<ContextInner>,
    origin: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let transport = origin.tcp()?;
    let status = Status::decode(payload)?;
    transport.set_verified(status);
    Ok(())
}

/// A server claims one or more searched CIDs.
fn handle_search_response(
    context: &Arc<ContextInner>,
    origin: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let _guid = payload.get_slice(12)?;
    let sequence_id = payload.get_u32()?;
    let found = payload.get_u8()? != 0;
    let address = get_inet_addr(payload)?;
    let port = payload.get_u16()?;
    if !found {
        return Ok(());
    }
    // Accept the advertised address when explicitly given, otherwise reply
    // to wherever the datagram came from.
    let ip = address.unwrap_or_else(|| origin.source().ip());
    let server = SocketAddr::new(ip, port);

    let count = payload.get_u16()? as usize;
    let mut cids = Vec::with_capacity(count);
    for _ in 0..count {
        cids.push(payload.get_u32()?);
    }
    context
        .search
        .search_response(context, sequence_id, server, &cids);
    Ok(())
}

/// Server response to CREATE_CHANNEL.
fn handle_create_channel(
    context: &Arc<ContextInner>,
    origin: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let transport = origin.tcp()?;
    let cid = payload.get_u32()?;
    let sid = payload.get_u32()?;
    let status = Status::decode(payload)?;
    match context.lookup_channel(cid) {
        Some(channel) => channel.create_channel_response(transport, sid, status),
        None => debug!(cid, "create-channel response for unknown channel"),
    }
    Ok(())
}

fn handle_destroy_channel(
    context: &Arc<ContextInner>,
    _: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let sid = payload.get_u32()?;
    let cid = payload.get_u32()?;
    if let Some(channel) = context.lookup_channel(cid) {
        debug!(cid, sid, name = channel.name(), "server destroyed channel");
    }
    Ok(())
}

/// Data responses: look the operation up by IOID and forward the payload.
fn handle_data_response(
    _: &Arc<ContextInner>,
    origin: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let transport = origin.tcp()?;
    let ioid = payload.get_u32()?;
    match transport.lookup_request(ioid) {
        Some(request) => request.response(transport.clone(), payload),
        None => {
            // Late response after cancel or disconnect; drop silently.
            trace!(ioid, "response for unknown ioid");
            let rest = payload.remaining();
            payload.skip(rest)?;
            Ok(())
        }
    }
}

fn handle_cancel_ack(
    _: &Arc<ContextInner>,
    _: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let ioid = payload.get_u32()?;
    trace!(ioid, "cancel acknowledged");
    Ok(())
}

/// Out-of-band server message addressed to one operation's requester.
fn handle_requester_message(
    _: &Arc<ContextInner>,
    origin: &Origin,
    _: u8,
    payload: &mut ByteBuf,
) -> Result<()> {
    let transport = origin.tcp()?;
    let ioid = payload.get_u32()?;
    let _message_type = payload.get_u8()?;
    let text = payload.get_string()?;
    match transport.lookup_request(ioid) {
        Some(request) => request.message(&text),
        None => debug!(ioid, %text, "server message for unknown ioid"),
    }
    Ok(())
}
