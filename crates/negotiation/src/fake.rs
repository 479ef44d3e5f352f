//! In-memory [`PeerConnection`] pair with real offer/answer bookkeeping.
//!
//! Each side tracks the channels and tracks it created locally; an item is
//! negotiated once it has been carried through a full offer/answer exchange.
//! Data channels only pass messages after both sides negotiated them.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::connection::{
    ConnectionError, ConnectionEvent, DataChannel, IceCandidate, MediaTrack, PeerConnection,
    SdpKind, SessionDescription, SignalingPhase, TrackKind,
};

const ITEM_PREFIX: &str = "a=beach-item:";
const CHANNEL: &str = "channel:";
const TRACK: &str = "track:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    fn host(self) -> u8 {
        match self {
            Side::Left => 1,
            Side::Right => 2,
        }
    }
}

#[derive(Default)]
struct Wire {
    inboxes: Mutex<HashMap<(Side, String), mpsc::UnboundedSender<Bytes>>>,
}

pub struct FakeConnection {
    side: Side,
    wire: Arc<Wire>,
    state: Mutex<FakeState>,
    events: broadcast::Sender<ConnectionEvent>,
}

struct FakeState {
    phase: SignalingPhase,
    closed: bool,
    has_remote: bool,
    local_items: BTreeSet<String>,
    negotiated: BTreeSet<String>,
    local_offer: Option<BTreeSet<String>>,
    remote_offer: Option<BTreeSet<String>>,
    generation: u64,
    candidates_gathered: u32,
    candidates_applied: u32,
    channels: HashMap<String, Arc<FakeChannel>>,
}

impl FakeConnection {
    /// Two connections wired to each other.
    pub fn pair() -> (Arc<FakeConnection>, Arc<FakeConnection>) {
        let wire = Arc::new(Wire::default());
        (
            Arc::new(Self::new(Side::Left, Arc::clone(&wire))),
            Arc::new(Self::new(Side::Right, wire)),
        )
    }

    fn new(side: Side, wire: Arc<Wire>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            side,
            wire,
            state: Mutex::new(FakeState {
                phase: SignalingPhase::Stable,
                closed: false,
                has_remote: false,
                local_items: BTreeSet::new(),
                negotiated: BTreeSet::new(),
                local_offer: None,
                remote_offer: None,
                generation: 0,
                candidates_gathered: 0,
                candidates_applied: 0,
                channels: HashMap::new(),
            }),
            events,
        }
    }

    /// Items carried through a completed exchange, e.g. `channel:chat`.
    pub fn negotiated_items(&self) -> Vec<String> {
        self.state.lock().negotiated.iter().cloned().collect()
    }

    /// Labels of every data channel this side can use.
    pub fn channel_labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.state.lock().channels.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn applied_candidates(&self) -> u32 {
        self.state.lock().candidates_applied
    }

    fn emit(&self, events: Vec<ConnectionEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    fn gather(&self, state: &mut FakeState) -> ConnectionEvent {
        state.candidates_gathered += 1;
        ConnectionEvent::IceCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 192.0.2.{} {} typ host",
                state.candidates_gathered,
                self.side.host(),
                50000 + state.candidates_gathered
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        })
    }

    fn channel_endpoint(&self, state: &mut FakeState, label: &str) -> Arc<FakeChannel> {
        if let Some(existing) = state.channels.get(label) {
            return Arc::clone(existing);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.wire
            .inboxes
            .lock()
            .insert((self.side, label.to_string()), tx);
        let channel = Arc::new(FakeChannel {
            label: label.to_string(),
            side: self.side,
            wire: Arc::clone(&self.wire),
            open: AtomicBool::new(false),
            inbox: tokio::sync::Mutex::new(rx),
        });
        state.channels.insert(label.to_string(), Arc::clone(&channel));
        channel
    }

    /// Mark `items` negotiated, surfacing remote-created ones as events.
    fn settle_items(
        &self,
        state: &mut FakeState,
        items: BTreeSet<String>,
        events: &mut Vec<ConnectionEvent>,
    ) {
        for item in items {
            if !state.negotiated.insert(item.clone()) {
                continue;
            }
            let remote_origin = !state.local_items.contains(&item);
            if let Some(label) = item.strip_prefix(CHANNEL) {
                let channel = self.channel_endpoint(state, label);
                channel.open.store(true, Ordering::SeqCst);
                if remote_origin {
                    events.push(ConnectionEvent::DataChannel(channel));
                }
            } else if let Some(track) = item.strip_prefix(TRACK).and_then(parse_track) {
                if remote_origin {
                    events.push(ConnectionEvent::Track(track));
                }
            }
        }
    }

    fn enter_stable(&self, state: &mut FakeState, events: &mut Vec<ConnectionEvent>) {
        state.phase = SignalingPhase::Stable;
        events.push(ConnectionEvent::SignalingStateChange(SignalingPhase::Stable));
        if !state.local_items.is_subset(&state.negotiated) {
            events.push(ConnectionEvent::NegotiationNeeded);
        }
    }

    fn mutate(&self, item: String) -> Result<Vec<ConnectionEvent>, ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        let mut events = Vec::new();
        if state.local_items.insert(item) && state.phase == SignalingPhase::Stable {
            events.push(ConnectionEvent::NegotiationNeeded);
        }
        Ok(events)
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    fn signaling_phase(&self) -> SignalingPhase {
        self.state.lock().phase
    }

    fn has_remote_description(&self) -> bool {
        self.state.lock().has_remote
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        if state.phase == SignalingPhase::HaveRemoteOffer {
            return Err(ConnectionError::InvalidState {
                op: "create_offer",
                phase: state.phase,
            });
        }
        state.generation += 1;
        let items: BTreeSet<String> = state.local_items.union(&state.negotiated).cloned().collect();
        Ok(SessionDescription::offer(render(state.generation, &items)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        let Some(items) = state.remote_offer.clone() else {
            return Err(ConnectionError::InvalidState {
                op: "create_answer",
                phase: state.phase,
            });
        };
        state.generation += 1;
        Ok(SessionDescription::answer(render(state.generation, &items)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConnectionError::Closed);
            }
            let phase = state.phase;
            match (description.kind, phase) {
                (SdpKind::Offer, SignalingPhase::Stable | SignalingPhase::HaveLocalOffer) => {
                    state.local_offer = Some(parse(&description.sdp)?);
                    state.phase = SignalingPhase::HaveLocalOffer;
                    if phase != SignalingPhase::HaveLocalOffer {
                        events.push(ConnectionEvent::SignalingStateChange(
                            SignalingPhase::HaveLocalOffer,
                        ));
                    }
                    events.push(self.gather(&mut state));
                }
                (SdpKind::Answer, SignalingPhase::HaveRemoteOffer) => {
                    let items = parse(&description.sdp)?;
                    state.remote_offer = None;
                    self.settle_items(&mut state, items, &mut events);
                    events.push(self.gather(&mut state));
                    self.enter_stable(&mut state, &mut events);
                }
                (SdpKind::Rollback, SignalingPhase::HaveLocalOffer) => {
                    state.local_offer = None;
                    state.phase = SignalingPhase::Stable;
                    events.push(ConnectionEvent::SignalingStateChange(SignalingPhase::Stable));
                }
                (_, phase) => {
                    return Err(ConnectionError::InvalidState {
                        op: "set_local_description",
                        phase,
                    })
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConnectionError::Closed);
            }
            match (description.kind, state.phase) {
                (SdpKind::Offer, SignalingPhase::Stable) => {
                    state.remote_offer = Some(parse(&description.sdp)?);
                    state.has_remote = true;
                    state.phase = SignalingPhase::HaveRemoteOffer;
                    events.push(ConnectionEvent::SignalingStateChange(
                        SignalingPhase::HaveRemoteOffer,
                    ));
                }
                (SdpKind::Answer, SignalingPhase::HaveLocalOffer) => {
                    let items = parse(&description.sdp)?;
                    state.local_offer = None;
                    state.has_remote = true;
                    self.settle_items(&mut state, items, &mut events);
                    self.enter_stable(&mut state, &mut events);
                }
                (_, phase) => {
                    return Err(ConnectionError::InvalidState {
                        op: "set_remote_description",
                        phase,
                    })
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        if !state.has_remote {
            return Err(ConnectionError::InvalidState {
                op: "add_ice_candidate",
                phase: state.phase,
            });
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(ConnectionError::Sdp(candidate.candidate));
        }
        state.candidates_applied += 1;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, ConnectionError> {
        let events = self.mutate(format!("{CHANNEL}{label}"))?;
        let channel = {
            let mut state = self.state.lock();
            self.channel_endpoint(&mut state, label)
        };
        self.emit(events);
        Ok(channel)
    }

    async fn add_track(&self, track: MediaTrack) -> Result<(), ConnectionError> {
        let kind = match track.kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let events = self.mutate(format!("{TRACK}{kind}:{}", track.id))?;
        self.emit(events);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for channel in state.channels.values() {
            channel.open.store(false, Ordering::SeqCst);
        }
        self.wire
            .inboxes
            .lock()
            .retain(|(side, _), _| *side != self.side);
    }
}

pub struct FakeChannel {
    label: String,
    side: Side,
    wire: Arc<Wire>,
    open: AtomicBool,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl FakeChannel {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, payload: Bytes) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::ChannelNotOpen(self.label.clone()));
        }
        let peer = self
            .wire
            .inboxes
            .lock()
            .get(&(self.side.other(), self.label.clone()))
            .cloned()
            .ok_or_else(|| ConnectionError::ChannelNotOpen(self.label.clone()))?;
        peer.send(payload).map_err(|_| ConnectionError::Closed)
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbox.lock().await.recv().await
    }
}

fn render(generation: u64, items: &BTreeSet<String>) -> String {
    let mut sdp = format!("v=0\r\no=- {generation} 0 IN IP4 0.0.0.0\r\ns=-\r\n");
    for item in items {
        sdp.push_str(ITEM_PREFIX);
        sdp.push_str(item);
        sdp.push_str("\r\n");
    }
    sdp
}

fn parse(sdp: &str) -> Result<BTreeSet<String>, ConnectionError> {
    if !sdp.starts_with("v=0") {
        return Err(ConnectionError::Sdp("missing version line".into()));
    }
    Ok(sdp
        .lines()
        .filter_map(|line| line.strip_prefix(ITEM_PREFIX))
        .map(|item| item.trim().to_string())
        .collect())
}

fn parse_track(item: &str) -> Option<MediaTrack> {
    let (kind, id) = item.split_once(':')?;
    let kind = match kind {
        "audio" => TrackKind::Audio,
        "video" => TrackKind::Video,
        _ => return None,
    };
    Some(MediaTrack {
        id: id.to_string(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(offerer: &FakeConnection, answerer: &FakeConnection) {
        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();
    }

    #[tokio::test]
    async fn channel_opens_after_exchange() {
        let (left, right) = FakeConnection::pair();
        let mut right_events = right.subscribe();
        let chat = left.create_data_channel("chat").await.unwrap();
        assert!(chat.send(Bytes::from_static(b"early")).is_err());

        exchange(&left, &right).await;
        assert_eq!(left.signaling_phase(), SignalingPhase::Stable);
        assert_eq!(right.signaling_phase(), SignalingPhase::Stable);

        let remote = loop {
            match right_events.recv().await.unwrap() {
                ConnectionEvent::DataChannel(channel) => break channel,
                _ => continue,
            }
        };
        assert_eq!(remote.label(), "chat");
        chat.send(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(remote.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn mutation_while_stable_requests_negotiation() {
        let (left, _right) = FakeConnection::pair();
        let mut events = left.subscribe();
        left.add_track(MediaTrack {
            id: "cam".into(),
            kind: TrackKind::Video,
        })
        .await
        .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::NegotiationNeeded
        ));
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let (left, right) = FakeConnection::pair();
        assert!(left
            .set_local_description(SessionDescription::rollback())
            .await
            .is_err());
        assert!(right.create_answer().await.is_err());

        let offer = left.create_offer().await.unwrap();
        left.set_local_description(offer.clone()).await.unwrap();
        assert!(matches!(
            left.set_remote_description(offer).await,
            Err(ConnectionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description() {
        let (left, right) = FakeConnection::pair();
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 192.0.2.1 50001 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        assert!(right.add_ice_candidate(candidate.clone()).await.is_err());
        exchange(&left, &right).await;
        right.add_ice_candidate(candidate).await.unwrap();
        assert_eq!(right.applied_candidates(), 1);
    }

    #[tokio::test]
    async fn rollback_keeps_local_items_pending() {
        let (left, right) = FakeConnection::pair();
        left.create_data_channel("mine").await.unwrap();
        let offer = left.create_offer().await.unwrap();
        left.set_local_description(offer).await.unwrap();
        left.set_local_description(SessionDescription::rollback())
            .await
            .unwrap();
        assert_eq!(left.signaling_phase(), SignalingPhase::Stable);
        assert!(left.negotiated_items().is_empty());

        let mut events = left.subscribe();
        right.create_data_channel("theirs").await.unwrap();
        exchange(&right, &left).await;
        let mut renegotiate = false;
        while let Ok(event) = events.try_recv() {
            renegotiate |= matches!(event, ConnectionEvent::NegotiationNeeded);
        }
        assert!(renegotiate);
        assert_eq!(left.negotiated_items(), vec!["channel:theirs".to_string()]);
    }
}
