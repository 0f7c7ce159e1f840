//! # Client Configuration
//!
//! Configuration for the client context, sourced either from the standard
//! `EPICS_PVA_*` environment variables or constructed directly as a plain
//! struct. The struct is serde-derived so deployments can embed it in
//! their own configuration files.
//!
//! ## Recognised environment keys
//!
//! | Key | Effect |
//! |---|---|
//! | `EPICS_PVA_ADDR_LIST` | extra search targets (space-separated `host[:port]`) |
//! | `EPICS_PVA_AUTO_ADDR_LIST` | append discovered broadcast addresses (`YES`/`NO`) |
//! | `EPICS_PVA_CONN_TMO` | inactivity before a transport is unresponsive (seconds) |
//! | `EPICS_PVA_BEACON_PERIOD` | heartbeat cadence (seconds) |
//! | `EPICS_PVA_BROADCAST_PORT` | UDP search/beacon port |
//! | `EPICS_PVA_SERVER_PORT` | TCP server port for search targets |
//! | `EPICS_PVA_MAX_ARRAY_BYTES` | receive buffer cap |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ClientError, Result};
use crate::wire::{DEFAULT_BROADCAST_PORT, DEFAULT_SERVER_PORT};

/// Client context configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Extra search targets, space-separated `host[:port]`.
    pub addr_list: String,

    /// Whether to append discovered broadcast addresses to the search
    /// target list.
    pub auto_addr_list: bool,

    /// Inactivity period after which a transport is declared unresponsive.
    pub connection_timeout: Duration,

    /// Cadence of the heartbeat timer (echo emission and liveness check).
    pub beacon_period: Duration,

    /// UDP port used for search requests and beacon listening.
    pub broadcast_port: u16,

    /// Default TCP port assumed for search targets given without a port.
    pub server_port: u16,

    /// Upper bound on the receive buffer (and thus on any single
    /// deserialized application message).
    pub max_array_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr_list: String::new(),
            auto_addr_list: true,
            connection_timeout: Duration::from_secs(30),
            beacon_period: Duration::from_secs(15),
            broadcast_port: DEFAULT_BROADCAST_PORT,
            server_port: DEFAULT_SERVER_PORT,
            max_array_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Build a configuration from the process environment, falling back to
    /// protocol defaults for unset or unparseable keys (unparseable values
    /// are logged and ignored, matching the reference behavior).
    pub fn from_env() -> Self {
        let mut cfg = ClientConfig::default();
        if let Ok(v) = std::env::var("EPICS_PVA_ADDR_LIST") {
            cfg.addr_list = v;
        }
        if let Ok(v) = std::env::var("EPICS_PVA_AUTO_ADDR_LIST") {
            cfg.auto_addr_list = !matches!(v.trim(), "NO" | "no" | "0" | "false" | "FALSE");
        }
        if let Some(v) = parse_env_f64("EPICS_PVA_CONN_TMO") {
            cfg.connection_timeout = Duration::from_secs_f64(v);
        }
        if let Some(v) = parse_env_f64("EPICS_PVA_BEACON_PERIOD") {
            cfg.beacon_period = Duration::from_secs_f64(v);
        }
        if let Some(v) = parse_env("EPICS_PVA_BROADCAST_PORT") {
            cfg.broadcast_port = v;
        }
        if let Some(v) = parse_env("EPICS_PVA_SERVER_PORT") {
            cfg.server_port = v;
        }
        if let Some(v) = parse_env("EPICS_PVA_MAX_ARRAY_BYTES") {
            cfg.max_array_bytes = v;
        }
        cfg
    }

    /// Resolve the UDP search target list.
    ///
    /// Targets come from `addr_list`; when `auto_addr_list` is set, the
    /// broadcast addresses discovered from the OS interface list are
    /// appended (falling back to the limited broadcast address) so
    /// servers on the local segment are reached without explicit
    /// configuration.
    pub fn search_addresses(&self) -> Result<Vec<SearchAddress>> {
        let mut out: Vec<SearchAddress> = Vec::new();
        for spec in self.addr_list.split_whitespace() {
            let addr = parse_host_port(spec, self.broadcast_port)?;
            out.push(SearchAddress {
                addr,
                broadcast: is_broadcast_ip(addr.ip()),
            });
        }
        if self.auto_addr_list {
            let mut discovered = interface_broadcast_addresses();
            if discovered.is_empty() {
                discovered.push(Ipv4Addr::BROADCAST);
            }
            for ip in discovered {
                let addr = SocketAddr::new(IpAddr::V4(ip), self.broadcast_port);
                if !out.iter().any(|s| s.addr == addr) {
                    out.push(SearchAddress {
                        addr,
                        broadcast: true,
                    });
                }
            }
        }
        if out.is_empty() {
            warn!("empty search address list and auto address list disabled");
        }
        Ok(out)
    }
}

/// Broadcast addresses of the local interfaces, per the OS.
#[cfg(target_os = "linux")]
fn interface_broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    if let Ok(interfaces) = nix::ifaddrs::getifaddrs() {
        for interface in interfaces {
            if let Some(broadcast) = interface.broadcast {
                if let Some(sin) = broadcast.as_sockaddr_in() {
                    let ip = Ipv4Addr::from(sin.ip());
                    if !out.contains(&ip) {
                        out.push(ip);
                    }
                }
            }
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn interface_broadcast_addresses() -> Vec<Ipv4Addr> {
    Vec::new()
}

/// A resolved search target with its unicast/broadcast classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchAddress {
    pub addr: SocketAddr,
    pub broadcast: bool,
}

fn is_broadcast_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_broadcast() || v4.octets()[3] == 255,
        IpAddr::V6(_) => false,
    }
}

/// Parse one `host[:port]` element of an address list.
pub fn parse_host_port(spec: &str, default_port: u16) -> Result<SocketAddr> {
    let (host, port) = match spec.rsplit_once(':') {
        Some((h, p)) if !h.is_empty() => {
            let port = p.parse::<u16>().map_err(|_| {
                ClientError::UsageError(format!("bad port in address {spec:?}"))
            })?;
            (h, port)
        }
        _ => (spec, default_port),
    };
    let ip: IpAddr = host
        .parse()
        .or_else(|_| resolve_host(host))
        .map_err(|_| ClientError::UsageError(format!("unresolvable address {spec:?}")))?;
    Ok(SocketAddr::new(ip, port))
}

fn resolve_host(host: &str) -> std::result::Result<IpAddr, std::io::Error> {
    use std::net::ToSocketAddrs;
    let mut addrs = (host, 0u16).to_socket_addrs()?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparseable {key}={raw:?}");
            None
        }
    }
}

fn parse_env_f64(key: &str) -> Option<f64> {
    parse_env::<f64>(key).filter(|v| *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.broadcast_port, 5076);
        assert_eq!(cfg.server_port, 5075);
        assert_eq!(cfg.connection_timeout, Duration::from_secs(30));
        assert_eq!(cfg.beacon_period, Duration::from_secs(15));
        assert!(cfg.auto_addr_list);
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            parse_host_port("127.0.0.1:7001", 5076).unwrap(),
            "127.0.0.1:7001".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_host_port("10.0.0.255", 5076).unwrap(),
            "10.0.0.255:5076".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_host_port("127.0.0.1:notaport", 5076).is_err());
        assert!(parse_host_port("definitely.not.a.real.host.invalid", 5076).is_err());
    }

    #[test]
    fn search_addresses_classify_broadcast() {
        let cfg = ClientConfig {
            addr_list: "127.0.0.1:7010 10.1.255.255".into(),
            auto_addr_list: true,
            ..ClientConfig::default()
        };
        let addrs = cfg.search_addresses().unwrap();
        // Configured targets come first, classified by address form.
        assert!(!addrs[0].broadcast);
        assert!(addrs[1].broadcast);
        // Auto-discovery appends at least one broadcast target on the
        // well-known port (interface broadcasts, or the limited
        // broadcast fallback).
        assert!(addrs.len() > 2);
        assert!(addrs[2..]
            .iter()
            .all(|s| s.broadcast && s.addr.port() == cfg.broadcast_port));
    }

    #[test]
    fn explicit_targets_only_when_auto_is_off() {
        let cfg = ClientConfig {
            addr_list: "127.0.0.1:7010".into(),
            auto_addr_list: false,
            ..ClientConfig::default()
        };
        let addrs = cfg.search_addresses().unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(!addrs[0].broadcast);
    }
}
