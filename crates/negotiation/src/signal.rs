use beach_dispatch::{DispatchError, DispatchResult, EndpointId, Receiver};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::connection::{IceCandidate, SdpKind, SessionDescription};
use crate::lock::RequestId;
use crate::peer::PeerEvent;

pub const OFFER: &str = "offer";
pub const ANSWER: &str = "answer";
pub const ICE_CANDIDATE: &str = "icecandidate";
pub const LOCK_REQUEST: &str = "lockRequest";
pub const LOCK_RESPONSE: &str = "lockResponse";
pub const LOCK_RELEASE: &str = "lockRelease";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LockMessage {
    pub id: RequestId,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    LockRequest(RequestId),
    LockResponse(RequestId),
    LockRelease(RequestId),
}

impl Signal {
    pub(crate) fn decode(kind: &str, data: Value) -> DispatchResult<Self> {
        let signal = match kind {
            OFFER => Signal::Offer(description(SdpKind::Offer, data)?),
            ANSWER => Signal::Answer(description(SdpKind::Answer, data)?),
            ICE_CANDIDATE => Signal::Candidate(serde_json::from_value(data)?),
            LOCK_REQUEST => Signal::LockRequest(lock_id(data)?),
            LOCK_RESPONSE => Signal::LockResponse(lock_id(data)?),
            LOCK_RELEASE => Signal::LockRelease(lock_id(data)?),
            other => return Err(DispatchError::UnknownType(other.to_string())),
        };
        Ok(signal)
    }
}

fn description(kind: SdpKind, data: Value) -> DispatchResult<SessionDescription> {
    let mut description: SessionDescription = serde_json::from_value(data)?;
    description.kind = kind;
    Ok(description)
}

fn lock_id(data: Value) -> DispatchResult<RequestId> {
    Ok(serde_json::from_value::<LockMessage>(data)?.id)
}

pub(crate) fn lock_payload(id: RequestId) -> Value {
    serde_json::json!({ "id": id })
}

/// Receiver registered for a negotiation peer; feeds the peer's driver.
pub(crate) struct PeerInbox {
    pub remote: EndpointId,
    pub signals: mpsc::UnboundedSender<Signal>,
    pub events: broadcast::Sender<PeerEvent>,
}

impl Receiver for PeerInbox {
    fn peer_id(&self) -> Option<&EndpointId> {
        Some(&self.remote)
    }

    fn handle(&self, _from: &EndpointId, kind: &str, data: Value) -> DispatchResult<()> {
        let signal = Signal::decode(kind, data)?;
        self.signals.send(signal).map_err(|_| DispatchError::Closed)
    }

    fn on_data(&self, from: &EndpointId, data: Value) {
        let _ = self.events.send(PeerEvent::Data {
            from: from.clone(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_lock_messages() {
        assert_eq!(
            Signal::decode(LOCK_REQUEST, json!({"id": 42})).unwrap(),
            Signal::LockRequest(42)
        );
        assert!(Signal::decode(LOCK_RELEASE, json!({})).is_err());
    }

    #[test]
    fn description_kind_follows_envelope_type() {
        let signal = Signal::decode(ANSWER, json!({"type": "answer", "sdp": "v=0"})).unwrap();
        assert_eq!(signal, Signal::Answer(SessionDescription::answer("v=0")));
    }

    #[test]
    fn unknown_types_are_reported() {
        assert!(matches!(
            Signal::decode("bye", Value::Null),
            Err(DispatchError::UnknownType(kind)) if kind == "bye"
        ));
    }
}
