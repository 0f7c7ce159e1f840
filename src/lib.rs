//! # PVA Client
//!
//! Client-side core of the PV Access (PVA) network protocol: channel
//! discovery over UDP search, framed endian-aware messaging over shared
//! TCP virtual circuits, and per-channel get/put/rpc/monitor operations
//! with disconnect-aware completion delivery.
//!
//! ## Usage
//!
//! 1. Construct a [`ClientProvider`] (directly or through the process-wide
//!    [`provider::registry`]).
//! 2. Use the provider to obtain a [`ClientChannel`]; channels connect and
//!    reconnect in the background.
//! 3. Start operations on the channel, either blocking
//!    (`get`/`put_value`/`rpc` with a timeout) or callback-based
//!    (`get_with`/`put_with`/`rpc_with`/`monitor_with`).
//!
//! ```no_run
//! use std::time::Duration;
//! use pva_client::{ClientConfig, ClientProvider, PvRequest};
//!
//! # fn main() -> pva_client::Result<()> {
//! let provider = ClientProvider::new("pva", ClientConfig::from_env())?;
//! let channel = provider.connect("testScalar")?;
//! let value = channel.get(Duration::from_secs(3), PvRequest::default())?;
//! println!("testScalar = {value:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Ownership rules
//!
//! Downstream objects never hold upstream owners strongly: operations hold
//! their channel, channels hold their transport, transports and the search
//! machinery hold channels weakly, and user callbacks are invoked through
//! weak upgrades. The handle returned by an operation owns it; dropping
//! the last handle is the canonical disposal path.

pub mod channel;
pub mod config;
mod dispatcher;
pub mod error;
pub mod introspection;
pub mod ops;
pub mod provider;
pub mod pvdata;
mod search;
pub mod sync;
pub mod transport;
pub mod wire;

pub use channel::{ClientChannel, ConnectEvent, ConnectListener, ConnectionState};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use ops::{
    GetCallback, GetEvent, GetFieldCallback, Monitor, MonitorCallback, MonitorElement,
    MonitorEvent, Operation, ProcessCallback, PutCallback, PutEvent,
};
pub use provider::{ChannelOptions, ClientProvider};
pub use pvdata::{BitSet, FieldDesc, PvRequest, ScalarKind, Value};
pub use sync::{MonitorSync, SyncEvent};

/// The current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// Default budget for blocking operations.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

    /// Default inactivity period before a transport is unresponsive.
    pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default heartbeat cadence.
    pub const BEACON_PERIOD: Duration = Duration::from_secs(15);

    /// Default (and minimum) monitor queue size.
    pub const MONITOR_QUEUE_SIZE: usize = 2;
}
