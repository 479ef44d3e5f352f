//! Endpoint registry: one live channel per endpoint id.
//!
//! Handlers register a channel and get back the receiving half of its
//! outbound queue plus a [`Deregister`] guard. Routing only clones the
//! destination handle out of the map and pushes onto its queue, so no map
//! guard is ever held across an await.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use beach_dispatch::{EndpointId, Envelope, Listing};
use dashmap::DashMap;
use metrics::{counter, decrement_gauge, increment_gauge};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Socket,
    Stream,
}

impl ChannelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelMode::Socket => "socket",
            ChannelMode::Stream => "stream",
        }
    }
}

/// Why the relay closed a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer channel claimed the same endpoint id.
    Superseded,
    Heartbeat,
    /// The client sent an envelope with a `from` other than its own id.
    Identity,
    /// The client addressed an endpoint that is not registered.
    Unroutable,
    Draining { retry_after: u64 },
}

impl CloseReason {
    pub fn label(self) -> &'static str {
        match self {
            CloseReason::Superseded => "superseded",
            CloseReason::Heartbeat => "heartbeat timeout",
            CloseReason::Identity => "identity mismatch",
            CloseReason::Unroutable => "unroutable destination",
            CloseReason::Draining { .. } => "draining",
        }
    }
}

#[derive(Debug)]
pub enum Outbound {
    Listing(Listing),
    Envelope {
        number: u64,
        envelope: Envelope,
        /// Fired once the push has been handed to the client connection.
        ack: Option<oneshot::Sender<()>>,
    },
    Ping,
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    Probe,
    Evict,
}

pub struct ChannelHandle {
    id: Uuid,
    endpoint: EndpointId,
    mode: ChannelMode,
    tx: mpsc::UnboundedSender<Outbound>,
    counter: AtomicU64,
    awaiting_pong: AtomicBool,
    missed: AtomicU32,
    open: AtomicBool,
}

impl ChannelHandle {
    fn new(endpoint: EndpointId, mode: ChannelMode, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            mode,
            tx,
            counter: AtomicU64::new(0),
            awaiting_pong: AtomicBool::new(false),
            missed: AtomicU32::new(0),
            open: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Number of envelopes pushed so far.
    pub fn delivered(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    fn push(&self, outbound: Outbound) -> bool {
        self.is_open() && self.tx.send(outbound).is_ok()
    }

    pub fn record_pong(&self) {
        self.awaiting_pong.store(false, Ordering::Release);
        self.missed.store(0, Ordering::Release);
    }

    /// Advance the liveness state by one heartbeat period.
    pub fn tick_heartbeat(&self, max_missed: u32) -> HeartbeatTick {
        if self.awaiting_pong.swap(true, Ordering::AcqRel) {
            let missed = self.missed.fetch_add(1, Ordering::AcqRel) + 1;
            if missed >= max_missed {
                return HeartbeatTick::Evict;
            }
        }
        HeartbeatTick::Probe
    }

    pub(crate) fn probe(&self) -> bool {
        self.push(Outbound::Ping)
    }

    /// Stop accepting pushes and tell the connection task to close.
    /// Only the first call has any effect.
    pub fn close(&self, reason: CloseReason) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(endpoint = %self.endpoint, channel = %self.id, reason = reason.label(), "closing channel");
            let _ = self.tx.send(Outbound::Close(reason));
        }
    }
}

pub struct Registration {
    pub channel: Arc<ChannelHandle>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub guard: Deregister,
}

/// Removes the channel from the registry when dropped, unless a newer
/// channel has taken its id in the meantime.
pub struct Deregister {
    registry: Arc<EndpointRegistry>,
    channel: Arc<ChannelHandle>,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.channel.open.store(false, Ordering::Release);
        self.registry.remove(&self.channel);
        decrement_gauge!("beach_relay_channels_active", 1.0);
        debug!(endpoint = %self.channel.endpoint, channel = %self.channel.id, "channel deregistered");
    }
}

pub struct EndpointRegistry {
    channels: DashMap<EndpointId, Arc<ChannelHandle>>,
    accepting: AtomicBool,
    retry_after: AtomicU64,
    version: String,
}

impl EndpointRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            accepting: AtomicBool::new(true),
            retry_after: AtomicU64::new(0),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Claim `endpoint` for a new channel. The listing snapshot is queued as
    /// the channel's first message and any previous claim is closed.
    pub fn register(
        self: &Arc<Self>,
        endpoint: EndpointId,
        mode: ChannelMode,
        ip: Option<String>,
    ) -> Result<Registration, RelayError> {
        if !self.is_accepting() {
            return Err(RelayError::Draining);
        }

        let (tx, outbound) = mpsc::unbounded_channel();
        let channel = Arc::new(ChannelHandle::new(endpoint.clone(), mode, tx));
        let guard = Deregister {
            registry: Arc::clone(self),
            channel: Arc::clone(&channel),
        };
        increment_gauge!("beach_relay_channels_active", 1.0);
        counter!("beach_relay_registrations_total", 1, "mode" => mode.as_str());

        if let Some(previous) = self.channels.insert(endpoint.clone(), Arc::clone(&channel)) {
            info!(endpoint = %endpoint, previous = %previous.id, "endpoint claimed again; evicting older channel");
            previous.close(CloseReason::Superseded);
        }
        channel.push(Outbound::Listing(self.listing(ip)));

        // a drain that raced the insert above must still reach this channel
        if !self.is_accepting() {
            channel.close(CloseReason::Draining {
                retry_after: self.retry_after.load(Ordering::Acquire),
            });
        }

        info!(endpoint = %endpoint, channel = %channel.id, mode = mode.as_str(), "channel registered");
        Ok(Registration {
            channel,
            outbound,
            guard,
        })
    }

    /// Queue `envelope` on its destination channel and return its per-channel
    /// message number.
    pub fn route(
        &self,
        envelope: Envelope,
        ack: Option<oneshot::Sender<()>>,
    ) -> Result<u64, RelayError> {
        if envelope.kind.contains(['\r', '\n']) {
            return Err(RelayError::InvalidKind(envelope.kind));
        }
        let destination = self
            .channels
            .get(&envelope.to)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|channel| channel.is_open());
        let Some(channel) = destination else {
            counter!("beach_relay_route_not_found_total", 1);
            debug!(from = %envelope.from, to = %envelope.to, kind = %envelope.kind, "destination not registered");
            return Err(RelayError::NotFound(envelope.to));
        };

        let number = channel.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let to = envelope.to.clone();
        let pushed = channel.push(Outbound::Envelope {
            number,
            envelope,
            ack,
        });
        if !pushed {
            counter!("beach_relay_route_not_found_total", 1);
            return Err(RelayError::NotFound(to));
        }
        counter!("beach_relay_messages_routed_total", 1);
        Ok(number)
    }

    pub fn record_pong(&self, endpoint: &EndpointId) -> bool {
        match self.channels.get(endpoint) {
            Some(channel) => {
                channel.record_pong();
                true
            }
            None => false,
        }
    }

    pub fn listing(&self, ip: Option<String>) -> Listing {
        let mut peers: Vec<EndpointId> = self
            .channels
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        Listing {
            ip,
            version: self.version.clone(),
            peers,
        }
    }

    pub fn contains(&self, endpoint: &EndpointId) -> bool {
        self.channels.contains_key(endpoint)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Snapshot of the live channels.
    pub fn channels(&self) -> Vec<Arc<ChannelHandle>> {
        self.channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Refuse new registrations and close every channel with a retry hint.
    /// Returns how many channels were told to go away.
    pub fn drain(&self, retry_after: u64) -> usize {
        self.retry_after.store(retry_after, Ordering::Release);
        self.accepting.store(false, Ordering::Release);
        let channels = self.channels();
        for channel in &channels {
            channel.close(CloseReason::Draining { retry_after });
        }
        channels.len()
    }

    /// Drop `channel` from the map if it still owns its endpoint id.
    pub(crate) fn remove(&self, channel: &ChannelHandle) -> bool {
        self.channels
            .remove_if(&channel.endpoint, |_, current| current.id == channel.id)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(from: &str, to: &str, kind: &str) -> Envelope {
        Envelope::new(from.into(), to.into(), kind, json!({}))
    }

    #[test]
    fn listing_is_the_first_push() {
        let registry = EndpointRegistry::new();
        let _a = registry
            .register("A1".into(), ChannelMode::Stream, None)
            .unwrap();
        let mut b = registry
            .register("B2".into(), ChannelMode::Socket, Some("10.0.0.2".into()))
            .unwrap();
        match b.outbound.try_recv().unwrap() {
            Outbound::Listing(listing) => {
                assert_eq!(listing.ip.as_deref(), Some("10.0.0.2"));
                assert_eq!(listing.peers, vec![EndpointId::new("A1"), EndpointId::new("B2")]);
            }
            other => panic!("expected listing, got {other:?}"),
        }
    }

    #[test]
    fn routed_envelopes_are_numbered_per_channel() {
        let registry = EndpointRegistry::new();
        let mut b = registry
            .register("B2".into(), ChannelMode::Stream, None)
            .unwrap();
        let _ = b.outbound.try_recv();

        assert_eq!(registry.route(envelope("A1", "B2", "offer"), None), Ok(1));
        assert_eq!(registry.route(envelope("A1", "B2", ""), None), Ok(2));
        assert_eq!(b.channel.delivered(), 2);
        match b.outbound.try_recv().unwrap() {
            Outbound::Envelope { number, envelope, .. } => {
                assert_eq!(number, 1);
                assert_eq!(envelope.kind, "offer");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_destinations_and_bad_kinds_are_rejected() {
        let registry = EndpointRegistry::new();
        assert_eq!(
            registry.route(envelope("A1", "ghost", "offer"), None),
            Err(RelayError::NotFound("ghost".into()))
        );
        let _b = registry
            .register("B2".into(), ChannelMode::Stream, None)
            .unwrap();
        assert!(matches!(
            registry.route(envelope("A1", "B2", "of\nfer"), None),
            Err(RelayError::InvalidKind(_))
        ));
    }

    #[test]
    fn second_claim_supersedes_the_first() {
        let registry = EndpointRegistry::new();
        let mut first = registry
            .register("A1".into(), ChannelMode::Socket, None)
            .unwrap();
        let second = registry
            .register("A1".into(), ChannelMode::Stream, None)
            .unwrap();

        assert!(!first.channel.is_open());
        let _ = first.outbound.try_recv();
        assert!(matches!(
            first.outbound.try_recv(),
            Ok(Outbound::Close(CloseReason::Superseded))
        ));

        // the stale guard must not remove the new claim
        drop(first.guard);
        assert!(registry.contains(&"A1".into()));
        drop(second.guard);
        assert!(!registry.contains(&"A1".into()));
    }

    #[test]
    fn draining_closes_channels_and_refuses_new_ones() {
        let registry = EndpointRegistry::new();
        let mut a = registry
            .register("A1".into(), ChannelMode::Stream, None)
            .unwrap();
        assert_eq!(registry.drain(7), 1);
        let _ = a.outbound.try_recv();
        assert!(matches!(
            a.outbound.try_recv(),
            Ok(Outbound::Close(CloseReason::Draining { retry_after: 7 }))
        ));
        assert!(matches!(
            registry.register("B2".into(), ChannelMode::Socket, None),
            Err(RelayError::Draining)
        ));
        assert!(matches!(
            registry.route(envelope("B2", "A1", "offer"), None),
            Err(RelayError::NotFound(_))
        ));
    }

    #[test]
    fn heartbeat_evicts_after_consecutive_misses() {
        let registry = EndpointRegistry::new();
        let a = registry
            .register("A1".into(), ChannelMode::Stream, None)
            .unwrap();
        assert_eq!(a.channel.tick_heartbeat(2), HeartbeatTick::Probe);
        a.channel.record_pong();
        assert_eq!(a.channel.tick_heartbeat(2), HeartbeatTick::Probe);
        assert_eq!(a.channel.tick_heartbeat(2), HeartbeatTick::Probe);
        assert_eq!(a.channel.tick_heartbeat(2), HeartbeatTick::Evict);
        assert!(registry.record_pong(&"A1".into()));
        assert!(!registry.record_pong(&"B2".into()));
    }
}
