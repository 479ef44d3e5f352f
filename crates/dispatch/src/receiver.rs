use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::envelope::{EndpointId, Envelope};
use crate::error::{DispatchError, DispatchResult};

/// Consumer of inbound envelopes for one endpoint.
///
/// A receiver bound to a fixed remote peer only sees envelopes from that
/// peer; envelopes with an empty type go to [`Receiver::on_data`] and every
/// other type goes to [`Receiver::handle`].
pub trait Receiver: Send + Sync + 'static {
    fn peer_id(&self) -> Option<&EndpointId> {
        None
    }

    /// Handle a typed envelope. Unrecognized types should return
    /// [`DispatchError::UnknownType`].
    fn handle(&self, from: &EndpointId, kind: &str, data: Value) -> DispatchResult<()>;

    fn on_data(&self, from: &EndpointId, data: Value) {
        let _ = (from, data);
    }
}

/// Envelope as seen by a [`ChannelReceiver`] consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: EndpointId,
    /// Empty for opaque data.
    pub kind: String,
    pub data: Value,
}

/// Receiver that forwards everything it accepts into an unbounded channel.
pub struct ChannelReceiver {
    peer: Option<EndpointId>,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl ChannelReceiver {
    pub fn new(peer: Option<EndpointId>) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peer, tx }, rx)
    }
}

impl Receiver for ChannelReceiver {
    fn peer_id(&self) -> Option<&EndpointId> {
        self.peer.as_ref()
    }

    fn handle(&self, from: &EndpointId, kind: &str, data: Value) -> DispatchResult<()> {
        self.tx
            .send(Inbound {
                from: from.clone(),
                kind: kind.to_string(),
                data,
            })
            .map_err(|_| DispatchError::Closed)
    }

    fn on_data(&self, from: &EndpointId, data: Value) {
        let _ = self.tx.send(Inbound {
            from: from.clone(),
            kind: String::new(),
            data,
        });
    }
}

/// Apply the peer filter and hand `envelope` to `receiver`.
/// Returns whether the receiver accepted it.
pub(crate) fn deliver(receiver: &dyn Receiver, envelope: &Envelope) -> bool {
    if let Some(peer) = receiver.peer_id() {
        if *peer != envelope.from {
            trace!(from = %envelope.from, expected = %peer, "dropping envelope from other peer");
            return false;
        }
    }
    if envelope.is_opaque() {
        receiver.on_data(&envelope.from, envelope.data.clone());
        return true;
    }
    match receiver.handle(&envelope.from, &envelope.kind, envelope.data.clone()) {
        Ok(()) => true,
        Err(DispatchError::UnknownType(kind)) => {
            debug!(from = %envelope.from, kind = %kind, "no handler for envelope type");
            false
        }
        Err(err) => {
            warn!(from = %envelope.from, kind = %envelope.kind, error = %err, "receiver rejected envelope");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn peer_filter_drops_other_senders() {
        let (receiver, mut rx) = ChannelReceiver::new(Some("B2".into()));
        let foreign = Envelope::new("C3".into(), "A1".into(), "offer", json!({}));
        assert!(!deliver(&receiver, &foreign));
        let expected = Envelope::new("B2".into(), "A1".into(), "offer", json!({"sdp": "x"}));
        assert!(deliver(&receiver, &expected));
        let inbound = rx.try_recv().unwrap();
        assert_eq!(inbound.from, EndpointId::new("B2"));
        assert_eq!(inbound.kind, "offer");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn opaque_envelopes_route_to_on_data() {
        let (receiver, mut rx) = ChannelReceiver::new(None);
        let data = Envelope::new("B2".into(), "A1".into(), "", json!("hello"));
        assert!(deliver(&receiver, &data));
        let inbound = rx.try_recv().unwrap();
        assert!(inbound.kind.is_empty());
        assert_eq!(inbound.data, json!("hello"));
    }
}
