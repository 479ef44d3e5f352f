//! The media connection a negotiation peer drives.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalingPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("{op} is not valid in signaling phase {phase:?}")]
    InvalidState {
        op: &'static str,
        phase: SignalingPhase,
    },
    #[error("malformed session description: {0}")]
    Sdp(String),
    #[error("data channel {0} is not open")]
    ChannelNotOpen(String),
    #[error("connection closed")]
    Closed,
}

/// Bidirectional message channel negotiated over the connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn send(&self, payload: Bytes) -> Result<(), ConnectionError>;

    /// Next message from the remote side; `None` once the channel is gone.
    async fn recv(&self) -> Option<Bytes>;
}

#[derive(Clone)]
pub enum ConnectionEvent {
    SignalingStateChange(SignalingPhase),
    IceCandidate(IceCandidate),
    NegotiationNeeded,
    /// A channel created by the remote side became available.
    DataChannel(Arc<dyn DataChannel>),
    Track(MediaTrack),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::SignalingStateChange(phase) => {
                f.debug_tuple("SignalingStateChange").field(phase).finish()
            }
            ConnectionEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            ConnectionEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            ConnectionEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            ConnectionEvent::Track(track) => f.debug_tuple("Track").field(track).finish(),
        }
    }
}

/// Offer/answer state machine plus media, as exposed by a WebRTC stack.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    fn signaling_phase(&self) -> SignalingPhase;

    fn has_remote_description(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, ConnectionError>;

    async fn add_track(&self, track: MediaTrack) -> Result<(), ConnectionError>;

    async fn close(&self);
}
