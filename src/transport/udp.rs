//! # UDP Transport
//!
//! Datagram transport for the discovery side of the protocol: search
//! requests go out through an ephemeral-port socket, while beacons and
//! other broadcast traffic arrive on the well-known port (bound with
//! address reuse so several clients coexist on one host).
//!
//! Unlike TCP, datagrams are never segmented and every message header is
//! self-describing, so each datagram is parsed standalone. Datagrams from
//! ignored source addresses are dropped without parsing.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::dispatcher::{self, Origin};
use crate::error::Result;
use crate::provider::ContextInner;
use crate::wire::{ByteBuf, Header, HEADER_LEN, MAX_UDP_SEND};

/// One bound datagram socket with its receive task.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    ignored: Mutex<Vec<IpAddr>>,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind a datagram socket and start its receive task.
    ///
    /// `reuse` enables address reuse (and broadcast reception) for the
    /// well-known-port listener; the search socket binds an ephemeral port
    /// without it.
    pub(crate) fn bind(
        context: &Arc<ContextInner>,
        bind_addr: SocketAddr,
        reuse: bool,
    ) -> Result<Arc<UdpTransport>> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        if reuse {
            socket.set_reuse_address(true)?;
            #[cfg(unix)]
            socket.set_reuse_port(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        let local = std_socket.local_addr()?;

        let socket = {
            let _guard = context.handle.enter();
            Arc::new(UdpSocket::from_std(std_socket)?)
        };
        let transport = Arc::new(UdpTransport {
            socket,
            local,
            ignored: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        debug!(%local, reuse, "udp transport bound");

        context.handle.spawn(Self::receive_task(
            transport.clone(),
            Arc::downgrade(context),
        ));
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Drop all datagrams whose source address is in this list.
    pub fn set_ignored(&self, addrs: Vec<IpAddr>) {
        *self.ignored.lock() = addrs;
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Send one pre-framed datagram. Oversized datagrams are refused
    /// locally rather than fragmented.
    pub(crate) async fn send_to(&self, wire: &[u8], target: SocketAddr) -> Result<()> {
        if wire.len() > MAX_UDP_SEND {
            return Err(crate::error::ClientError::UsageError(format!(
                "datagram of {} bytes exceeds the {} byte UDP limit",
                wire.len(),
                MAX_UDP_SEND
            )));
        }
        self.socket.send_to(wire, target).await?;
        Ok(())
    }

    async fn receive_task(transport: Arc<UdpTransport>, context: Weak<ContextInner>) {
        let mut buf = vec![0u8; MAX_UDP_SEND];
        loop {
            if transport.closed.load(Ordering::Acquire) {
                break;
            }
            let (n, from) = match transport.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(local = %transport.local, error = %e, "udp receive error");
                    continue;
                }
            };
            if transport.ignored.lock().contains(&from.ip()) {
                trace!(%from, "dropping datagram from ignored source");
                continue;
            }
            let Some(context) = context.upgrade() else {
                break;
            };
            Self::process_datagram(&context, from, &buf[..n]);
        }
        trace!(local = %transport.local, "udp receive task finished");
    }

    /// Parse every message in one datagram; malformed trailing data only
    /// affects that datagram.
    fn process_datagram(context: &Arc<ContextInner>, from: SocketAddr, datagram: &[u8]) {
        let mut offset = 0;
        while datagram.len() - offset >= HEADER_LEN {
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&datagram[offset..offset + HEADER_LEN]);
            let header = match Header::decode(&raw) {
                Ok(h) => h,
                Err(e) => {
                    debug!(%from, error = %e, "malformed datagram header");
                    return;
                }
            };
            offset += HEADER_LEN;
            if header.control {
                continue;
            }
            let len = header.payload_size as usize;
            if datagram.len() - offset < len {
                debug!(%from, "truncated datagram payload");
                return;
            }
            let mut payload =
                ByteBuf::from_vec(datagram[offset..offset + len].to_vec(), header.order);
            offset += len;
            if let Err(e) = dispatcher::dispatch(
                context,
                Origin::Udp { from },
                header.version,
                header.command,
                &mut payload,
            ) {
                debug!(%from, command = header.command, error = %e,
                       "datagram handler failed");
            }
        }
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local", &self.local)
            .finish()
    }
}
