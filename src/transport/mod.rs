//! # Transport Layer
//!
//! Framed, versioned connections underneath the channel and operation
//! machinery:
//!
//! - [`codec`]: segmentation writer/decoder shared by both socket families
//! - [`tcp`]: the client-side TCP virtual circuit (handshake, heartbeat,
//!   owner tracking, send queue)
//! - [`udp`]: datagram transport for search requests and beacons
//!
//! A sender is a one-shot closure given exclusive access to the connection
//! writer; the per-transport FIFO queue of senders is what serialises
//! message framing across contending callers.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::provider::ContextInner;

pub mod codec;
pub mod tcp;
pub mod udp;

pub use codec::{DecodedMessage, MessageDecoder, MessageWriter};

/// One-shot sender invoked with exclusive access to the connection writer.
pub type SendFn = Box<dyn FnOnce(&mut MessageWriter) -> Result<()> + Send>;

/// Item on a transport's send queue.
pub(crate) enum SendItem {
    Message(SendFn),
    Shutdown,
}

/// Factory for outbound virtual circuits.
///
/// Abstracting the connector keeps the channel machinery independent of
/// the concrete socket family and lets tests substitute their own.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        context: &Arc<ContextInner>,
        remote: SocketAddr,
        priority: u16,
    ) -> Result<Arc<tcp::TcpTransport>>;
}

/// Default connector establishing PVA TCP circuits.
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        context: &Arc<ContextInner>,
        remote: SocketAddr,
        priority: u16,
    ) -> Result<Arc<tcp::TcpTransport>> {
        tcp::TcpTransport::connect(context, remote, priority).await
    }
}
