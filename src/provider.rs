//! # Client Provider and Context
//!
//! The context owns everything process-wide for one client instance: the
//! tokio runtime the transport tasks run on, the UDP sockets for search
//! and beacons, the search manager, the channel registry (by CID) and
//! cache (by name/options), and the TCP transport registry keyed by
//! (remote address, priority) so all channels to one server share a
//! virtual circuit.
//!
//! [`ClientProvider`] is the public face: build one (usually through the
//! process-wide [`registry`]), connect channels, drop it to shut
//! everything down.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{ChannelImpl, ClientChannel};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::search::SearchManager;
use crate::transport::tcp::TcpTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{Connector, TcpConnector};

/// Channel creation options.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ChannelOptions {
    /// Circuit priority, 0..=99. Channels with equal priority to the same
    /// server share one transport.
    pub priority: u16,
    /// Fixed server address (`host[:port]`); bypasses the search phase.
    pub address: Option<String>,
}

/// Beacon bookkeeping per source address.
struct BeaconInfo {
    guid: [u8; 12],
    sequence: u8,
}

/// Shared client context; internal to the crate.
pub struct ContextInner {
    pub(crate) config: ClientConfig,
    pub(crate) handle: tokio::runtime::Handle,
    pub(crate) search: SearchManager,
    connector: Box<dyn Connector>,

    channels: Mutex<HashMap<u32, Weak<ChannelImpl>>>,
    cache: Mutex<HashMap<(String, ChannelOptions), Arc<ChannelImpl>>>,
    transports: Mutex<HashMap<(SocketAddr, u16), Arc<TcpTransport>>>,
    search_udp: OnceLock<Arc<UdpTransport>>,
    beacon_udp: OnceLock<Arc<UdpTransport>>,
    beacons: Mutex<HashMap<SocketAddr, BeaconInfo>>,
    next_cid: AtomicU32,
    destroyed: AtomicBool,
}

impl ContextInner {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn lookup_channel(&self, cid: u32) -> Option<Arc<ChannelImpl>> {
        self.channels.lock().get(&cid).and_then(Weak::upgrade)
    }

    pub(crate) fn forget_channel(&self, cid: u32) {
        self.channels.lock().remove(&cid);
        self.cache
            .lock()
            .retain(|_, channel| channel.cid() != cid);
    }

    /// Get or establish the shared transport for `(remote, priority)`.
    ///
    /// Connecting happens outside the registry lock; if two binds race,
    /// the loser's fresh circuit is closed and the survivor shared.
    pub(crate) async fn acquire_transport(
        self: Arc<Self>,
        remote: SocketAddr,
        priority: u16,
    ) -> Result<Arc<TcpTransport>> {
        if self.is_destroyed() {
            return Err(ClientError::ConnectionClosed);
        }
        if let Some(existing) = self.transports.lock().get(&(remote, priority)) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let fresh = self.connector.connect(&self, remote, priority).await?;
        let winner = {
            let mut map = self.transports.lock();
            match map.get(&(remote, priority)) {
                Some(existing) if !existing.is_closed() => Some(existing.clone()),
                _ => {
                    map.insert((remote, priority), fresh.clone());
                    None
                }
            }
        };
        match winner {
            Some(existing) => {
                fresh.close(None);
                Ok(existing)
            }
            None => Ok(fresh),
        }
    }

    /// Drop a transport from the registry (called from its close path).
    pub(crate) fn forget_transport(&self, transport: &Arc<TcpTransport>) {
        self.transports
            .lock()
            .retain(|_, t| !Arc::ptr_eq(t, transport));
    }

    /// Track server beacons; an anomaly (new server, changed GUID, or a
    /// restarted sequence) boosts the search schedule for fast reconnect.
    pub(crate) fn beacon_received(&self, from: SocketAddr, guid: [u8; 12], sequence: u8) {
        let anomaly = {
            let mut beacons = self.beacons.lock();
            match beacons.get_mut(&from) {
                None => {
                    beacons.insert(from, BeaconInfo { guid, sequence });
                    true
                }
                Some(info) if info.guid != guid => {
                    *info = BeaconInfo { guid, sequence };
                    true
                }
                Some(info) => {
                    let restarted = sequence < info.sequence;
                    info.sequence = sequence;
                    restarted
                }
            }
        };
        if anomaly {
            debug!(%from, "beacon anomaly, boosting search");
            self.search.boost();
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("client context shutting down");
        let channels: Vec<Arc<ChannelImpl>> = {
            let mut cache = self.cache.lock();
            let list = cache.values().cloned().collect();
            cache.clear();
            list
        };
        for channel in channels {
            channel.destroy();
        }
        let transports: Vec<Arc<TcpTransport>> = {
            let mut map = self.transports.lock();
            let list = map.values().cloned().collect();
            map.clear();
            list
        };
        for transport in transports {
            transport.close(None);
        }
        if let Some(udp) = self.search_udp.get() {
            udp.close();
        }
        if let Some(udp) = self.beacon_udp.get() {
            udp.close();
        }
    }
}

/// Central client context; the entry point of the crate.
///
/// Owns a private tokio runtime for the transport tasks. Dropping the
/// provider destroys every channel, closes every circuit and shuts the
/// runtime down in the background.
pub struct ClientProvider {
    inner: Arc<ContextInner>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl ClientProvider {
    /// Look up a named provider in the process-wide registries and build
    /// an instance with the given configuration.
    ///
    /// The name may be prefixed `"clients:"` or `"servers:"` to select the
    /// registry; no prefix implies clients. The `"pva"` network provider
    /// is pre-registered.
    pub fn new(name: &str, config: ClientConfig) -> Result<ClientProvider> {
        let (registry, bare) = match name.split_once(':') {
            Some(("clients", rest)) => (registry::clients(), rest),
            Some(("servers", rest)) => (registry::servers(), rest),
            _ => (registry::clients(), name),
        };
        let factory = registry.lookup(bare).ok_or_else(|| {
            ClientError::UsageError(format!("no provider named {bare:?} registered"))
        })?;
        factory(&config)
    }

    /// Build the PVA network provider directly.
    pub fn pva(config: ClientConfig) -> Result<ClientProvider> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pva-client")
            .enable_all()
            .build()?;
        let inner = Arc::new(ContextInner {
            handle: runtime.handle().clone(),
            search: SearchManager::new(),
            connector: Box::new(TcpConnector),
            channels: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
            search_udp: OnceLock::new(),
            beacon_udp: OnceLock::new(),
            beacons: Mutex::new(HashMap::new()),
            next_cid: AtomicU32::new(1),
            destroyed: AtomicBool::new(false),
            config,
        });

        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let search_udp = UdpTransport::bind(&inner, SocketAddr::new(any, 0), false)?;
        let _ = inner.search_udp.set(search_udp.clone());
        // The beacon listener shares the well-known port with other
        // clients on the host; losing it degrades reconnect speed only.
        match UdpTransport::bind(
            &inner,
            SocketAddr::new(any, inner.config.broadcast_port),
            true,
        ) {
            Ok(beacon_udp) => {
                let _ = inner.beacon_udp.set(beacon_udp);
            }
            Err(e) => warn!(error = %e, "beacon listener unavailable"),
        }
        SearchManager::start(&inner, search_udp);

        info!(
            broadcast_port = inner.config.broadcast_port,
            "pva client provider started"
        );
        Ok(ClientProvider {
            inner,
            runtime: Some(runtime),
        })
    }

    /// Get a channel, creating it if the cache has no live entry.
    ///
    /// Does not block waiting for the connection; the returned channel
    /// connects (and reconnects) in the background.
    pub fn connect(&self, name: &str) -> Result<ClientChannel> {
        self.connect_with(name, ChannelOptions::default())
    }

    /// Get a channel with explicit options.
    pub fn connect_with(&self, name: &str, options: ChannelOptions) -> Result<ClientChannel> {
        if self.inner.is_destroyed() {
            return Err(ClientError::ConnectionClosed);
        }
        if options.priority > 99 {
            return Err(ClientError::UsageError(format!(
                "priority {} out of range 0..=99",
                options.priority
            )));
        }
        let key = (name.to_string(), options.clone());
        if let Some(existing) = self.inner.cache.lock().get(&key) {
            return Ok(ClientChannel::new(existing.clone()));
        }

        let cid = self.inner.next_cid.fetch_add(1, Ordering::Relaxed);
        let channel = ChannelImpl::new(&self.inner, name.to_string(), cid, options.priority)?;
        self.inner
            .channels
            .lock()
            .insert(cid, Arc::downgrade(&channel));
        self.inner.cache.lock().insert(key, channel.clone());

        match &options.address {
            Some(spec) => {
                // Fixed-address channel: skip the search phase entirely.
                let server =
                    crate::config::parse_host_port(spec, self.inner.config.server_port)?;
                channel.connect_direct(server);
            }
            None => channel.connect(),
        }
        Ok(ClientChannel::new(channel))
    }

    /// Drop one channel from the cache, destroying it.
    pub fn disconnect(&self, name: &str, options: ChannelOptions) -> bool {
        let key = (name.to_string(), options);
        let channel = self.inner.cache.lock().remove(&key);
        match channel {
            Some(channel) => {
                channel.destroy();
                true
            }
            None => false,
        }
    }

    /// Clear the channel cache, destroying every cached channel.
    pub fn disconnect_all(&self) {
        let channels: Vec<Arc<ChannelImpl>> = {
            let mut cache = self.inner.cache.lock();
            let list = cache.values().cloned().collect();
            cache.clear();
            list
        };
        for channel in channels {
            channel.destroy();
        }
    }
}

impl Drop for ClientProvider {
    fn drop(&mut self) {
        self.inner.destroy();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ClientProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProvider")
            .field("destroyed", &self.inner.is_destroyed())
            .finish()
    }
}

/// Process-wide provider registries.
///
/// Two singletons exist, one for client-side providers and one for
/// server-side ones. Registration takes `(name, factory)`; `lookup`
/// returns the factory. The `"pva"` factory is pre-registered with the
/// clients registry.
pub mod registry {
    use super::*;

    /// Factory building a provider from a configuration.
    pub type ProviderFactory = Arc<dyn Fn(&ClientConfig) -> Result<ClientProvider> + Send + Sync>;

    /// Named factory table.
    #[derive(Default)]
    pub struct ProviderRegistry {
        entries: Mutex<HashMap<String, ProviderFactory>>,
    }

    impl ProviderRegistry {
        /// Register a factory; returns false when the name is taken.
        pub fn add(&self, name: &str, factory: ProviderFactory) -> bool {
            let mut entries = self.entries.lock();
            if entries.contains_key(name) {
                return false;
            }
            entries.insert(name.to_string(), factory);
            true
        }

        /// Remove a registration.
        pub fn remove(&self, name: &str) -> bool {
            self.entries.lock().remove(name).is_some()
        }

        pub fn lookup(&self, name: &str) -> Option<ProviderFactory> {
            self.entries.lock().get(name).cloned()
        }

        /// Registered names, for diagnostics.
        pub fn names(&self) -> Vec<String> {
            self.entries.lock().keys().cloned().collect()
        }
    }

    /// Client-side provider registry ("pva" pre-registered).
    pub fn clients() -> &'static ProviderRegistry {
        static CLIENTS: OnceLock<ProviderRegistry> = OnceLock::new();
        CLIENTS.get_or_init(|| {
            let registry = ProviderRegistry::default();
            registry.add(
                "pva",
                Arc::new(|config| ClientProvider::pva(config.clone())),
            );
            registry
        })
    }

    /// Server-side provider registry.
    pub fn servers() -> &'static ProviderRegistry {
        static SERVERS: OnceLock<ProviderRegistry> = OnceLock::new();
        SERVERS.get_or_init(ProviderRegistry::default)
    }
}
