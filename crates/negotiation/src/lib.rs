//! Perfect negotiation between two Beach endpoints.
//!
//! A [`NegotiationPeer`] drives a [`PeerConnection`] through offer/answer
//! exchanges with one remote endpoint, carrying its signals over any
//! `beach_dispatch` connector. Renegotiations are serialized with a
//! [`DistributedLock`]; simultaneous offers are resolved by [`Role`].

pub mod config;
pub mod connection;
pub mod error;
pub mod fake;
pub mod lock;
pub mod peer;
pub mod politeness;
mod signal;

pub use config::NegotiationConfig;
pub use connection::{
    ConnectionError, ConnectionEvent, DataChannel, IceCandidate, MediaTrack, PeerConnection,
    SdpKind, SessionDescription, SignalingPhase, TrackKind,
};
pub use error::{NegotiationError, NegotiationResult};
pub use fake::FakeConnection;
pub use lock::{DistributedLock, LockAction, LockConfig, LockFailure, LockHolder, RequestId};
pub use peer::{LockGuard, NegotiationPeer, NegotiationStats, PeerEvent};
pub use politeness::{is_polite, Role};
pub use signal::{ANSWER, ICE_CANDIDATE, LOCK_RELEASE, LOCK_REQUEST, LOCK_RESPONSE, OFFER};
