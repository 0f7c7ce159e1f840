//! # Channel Search Manager
//!
//! Channels waiting for a server are registered here and announced in
//! periodic UDP search requests. Each channel carries its own back-off
//! state: the emission interval starts at the floor, doubles after every
//! round it goes unanswered (with jitter, so a fleet of clients does not
//! synchronise), and is capped. A beacon anomaly (a new server appearing
//! or one restarting) resets every pending channel back to the floor for
//! fast reconnect.
//!
//! Registrations are weak: dropping a channel unregisters it implicitly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::channel::ChannelImpl;
use crate::provider::ContextInner;
use crate::transport::udp::UdpTransport;
use crate::wire::{cmd, ByteBuf, ByteOrder, Header, SegmentPos, MAX_SEARCH_PAYLOAD};

/// Shortest per-channel emission interval.
const BACKOFF_FLOOR: Duration = Duration::from_millis(32);

/// Longest per-channel emission interval.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Scheduler granularity.
const TICK: Duration = Duration::from_millis(25);

/// Most channels announced in a single search message.
const MAX_CHANNELS_PER_MESSAGE: usize = 16;

struct SearchEntry {
    channel: Weak<ChannelImpl>,
    interval: Duration,
    next_due: Instant,
}

/// Registry of channels pending connection.
pub(crate) struct SearchManager {
    entries: Mutex<HashMap<u32, SearchEntry>>,
    sequence: AtomicU32,
}

impl SearchManager {
    pub(crate) fn new() -> Self {
        SearchManager {
            entries: Mutex::new(HashMap::new()),
            sequence: AtomicU32::new(rand::thread_rng().gen()),
        }
    }

    /// Register a channel for announcement; due immediately.
    pub(crate) fn register(&self, channel: &Arc<ChannelImpl>) {
        let mut entries = self.entries.lock();
        entries.insert(
            channel.cid(),
            SearchEntry {
                channel: Arc::downgrade(channel),
                interval: BACKOFF_FLOOR,
                next_due: Instant::now(),
            },
        );
        trace!(cid = channel.cid(), name = channel.name(), "search registered");
    }

    pub(crate) fn unregister(&self, cid: u32) {
        self.entries.lock().remove(&cid);
    }

    /// Beacon anomaly: reset every pending channel to the floor interval.
    pub(crate) fn boost(&self) {
        let now = Instant::now();
        for entry in self.entries.lock().values_mut() {
            entry.interval = BACKOFF_FLOOR;
            entry.next_due = now;
        }
    }

    /// A server claimed these CIDs. Matched channels leave the pending set
    /// and proceed to transport binding; unmatched CIDs are forwarded to
    /// the channel registry so duplicate responses can be diagnosed.
    pub(crate) fn search_response(
        &self,
        context: &Arc<ContextInner>,
        sequence_id: u32,
        server: SocketAddr,
        cids: &[u32],
    ) {
        for &cid in cids {
            let channel = {
                let mut entries = self.entries.lock();
                match entries.remove(&cid) {
                    Some(entry) => entry.channel.upgrade(),
                    None => context.lookup_channel(cid),
                }
            };
            match channel {
                Some(channel) => channel.search_response(server, sequence_id),
                None => debug!(cid, %server, "search response for unknown channel"),
            }
        }
    }

    /// Start the periodic emission task on the context runtime.
    pub(crate) fn start(context: &Arc<ContextInner>, udp: Arc<UdpTransport>) {
        let weak = Arc::downgrade(context);
        context.handle.spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The interval's first tick is immediate; consume it so the
            // first round goes out a full tick after registration.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(context) = weak.upgrade() else { break };
                if context.is_destroyed() {
                    break;
                }
                context.search.emit_due(&context, &udp).await;
            }
            trace!("search emission task finished");
        });
    }

    /// Emit one search round for every due channel.
    async fn emit_due(&self, context: &Arc<ContextInner>, udp: &UdpTransport) {
        let now = Instant::now();
        let mut due: Vec<(u32, String)> = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|cid, entry| match entry.channel.upgrade() {
                Some(channel) => {
                    if entry.next_due <= now {
                        due.push((*cid, channel.name().to_string()));
                        entry.interval = (entry.interval * 2).min(BACKOFF_CAP);
                        entry.next_due = now + jitter(entry.interval);
                    }
                    true
                }
                None => {
                    trace!(cid, "dropping search entry for dead channel");
                    false
                }
            });
        }
        if due.is_empty() {
            return;
        }

        let targets = match context.config.search_addresses() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "cannot resolve search addresses");
                return;
            }
        };
        let response_port = udp.local_addr().port();
        for batch in due.chunks(MAX_CHANNELS_PER_MESSAGE) {
            let sequence_id = self.sequence.fetch_add(1, Ordering::Relaxed);
            let wire = encode_search_request(sequence_id, response_port, batch);
            for target in &targets {
                if let Err(e) = udp.send_to(&wire, target.addr).await {
                    debug!(target = %target.addr, error = %e, "search send failed");
                }
            }
        }
    }
}

/// Randomise an interval by ±25% so independent clients spread out.
fn jitter(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    interval.mul_f64(factor)
}

/// Frame one SEARCH_REQUEST datagram.
///
/// Payload: sequence id, flags (bit 7 = reply required), three reserved
/// bytes, 16-byte response address (zeros = reply to the datagram
/// source), response port, protocol list, then the (cid, name) pairs.
pub(crate) fn encode_search_request(
    sequence_id: u32,
    response_port: u16,
    channels: &[(u32, String)],
) -> Vec<u8> {
    let mut payload = ByteBuf::new(ByteOrder::Little);
    payload.put_u32(sequence_id);
    payload.put_u8(0x80);
    payload.put_slice(&[0; 3]);
    payload.put_slice(&[0; 16]);
    payload.put_u16(response_port);
    payload.put_size(1);
    payload.put_string("tcp");
    payload.put_u16(channels.len() as u16);
    for (cid, name) in channels {
        payload.put_u32(*cid);
        payload.put_string(name);
    }
    debug_assert!(payload.len() <= MAX_SEARCH_PAYLOAD);

    let mut wire = Vec::with_capacity(8 + payload.len());
    wire.extend_from_slice(
        &Header::application(cmd::SEARCH_REQUEST, SegmentPos::None, payload.len() as u32)
            .encode(),
    );
    wire.extend_from_slice(payload.as_slice());
    wire
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_request_frame_parses_back() {
        let channels = vec![(7u32, "testScalar".to_string()), (9, "other".to_string())];
        let wire = encode_search_request(42, 5099, &channels);

        let header = Header::decode(&wire[..8].try_into().unwrap()).unwrap();
        assert_eq!(header.command, cmd::SEARCH_REQUEST);
        assert_eq!(header.payload_size as usize, wire.len() - 8);

        let mut payload = ByteBuf::from_vec(wire[8..].to_vec(), header.order);
        assert_eq!(payload.get_u32().unwrap(), 42);
        assert_eq!(payload.get_u8().unwrap(), 0x80);
        payload.skip(3).unwrap();
        payload.skip(16).unwrap();
        assert_eq!(payload.get_u16().unwrap(), 5099);
        assert_eq!(payload.get_size().unwrap(), 1);
        assert_eq!(payload.get_string().unwrap(), "tcp");
        assert_eq!(payload.get_u16().unwrap(), 2);
        assert_eq!(payload.get_u32().unwrap(), 7);
        assert_eq!(payload.get_string().unwrap(), "testScalar");
        assert_eq!(payload.get_u32().unwrap(), 9);
        assert_eq!(payload.get_string().unwrap(), "other");
        assert_eq!(payload.remaining(), 0);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let j = jitter(base);
            assert!(j >= Duration::from_secs(3) && j <= Duration::from_secs(5));
        }
    }
}
