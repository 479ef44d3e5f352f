use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DispatchResult;

/// Relay-level keep-alive probe.
pub const PING: &str = "ping";
/// Reply to [`PING`]; must be addressed from an endpoint to itself.
pub const PONG: &str = "pong";
/// Peer listing request or snapshot.
pub const LISTING: &str = "listing";
/// Relay is draining; carries a retry hint.
pub const SHUTDOWN: &str = "shutdown";

/// Opaque string naming a participant on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EndpointId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unit of signaling traffic. An empty `kind` marks an opaque data message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: EndpointId,
    pub to: EndpointId,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(from: EndpointId, to: EndpointId, kind: impl Into<String>, data: Value) -> Self {
        Self {
            from,
            to,
            kind: kind.into(),
            data,
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.kind.is_empty()
    }

    pub fn to_json(&self) -> DispatchResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> DispatchResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Snapshot of registered endpoints, pushed to every channel on registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub version: String,
    pub peers: Vec<EndpointId>,
}

/// Body returned by the relay for a routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAck {
    pub id: u64,
}

/// Payload of a [`SHUTDOWN`] notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownNotice {
    pub retry_after: u64,
    #[serde(default)]
    pub reason: String,
}

/// Close reason used by the relay's websocket endpoint when it wants the
/// client to come back later.
pub fn retry_reason(retry_after_secs: u64) -> String {
    format!("retry-after={retry_after_secs}")
}

pub fn parse_retry_reason(reason: &str) -> Option<u64> {
    reason.strip_prefix("retry-after=")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_type_field_on_the_wire() {
        let envelope = Envelope::new("A1".into(), "B2".into(), "offer", json!({"sdp": "v=0"}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"from": "A1", "to": "B2", "type": "offer", "data": {"sdp": "v=0"}})
        );
    }

    #[test]
    fn missing_type_decodes_as_opaque_data() {
        let envelope = Envelope::from_json(r#"{"from":"A1","to":"B2","data":[1,2]}"#).unwrap();
        assert!(envelope.is_opaque());
        assert_eq!(envelope.data, json!([1, 2]));
        let encoded = envelope.to_json().unwrap();
        assert!(!encoded.contains("\"type\""));
    }

    #[test]
    fn listing_is_not_an_envelope() {
        let text = r#"{"ip":"127.0.0.1","version":"0.1.0","peers":["A1"]}"#;
        assert!(Envelope::from_json(text).is_err());
        let listing: Listing = serde_json::from_str(text).unwrap();
        assert_eq!(listing.peers, vec![EndpointId::new("A1")]);
    }

    #[test]
    fn retry_reason_parses_back() {
        assert_eq!(parse_retry_reason(&retry_reason(7)), Some(7));
        assert_eq!(parse_retry_reason("superseded"), None);
    }

    #[test]
    fn endpoint_ids_order_lexicographically() {
        assert!(EndpointId::new("A1") < EndpointId::new("B2"));
        assert!(EndpointId::new("B10") < EndpointId::new("B2"));
    }
}
