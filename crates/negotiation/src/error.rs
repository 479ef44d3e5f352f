use beach_dispatch::{DispatchError, EndpointId};
use thiserror::Error;

use crate::connection::{ConnectionError, SignalingPhase};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("lock request to {0} timed out")]
    LockTimeout(EndpointId),
    #[error("peer {0} is unreachable")]
    Unreachable(EndpointId),
    #[error("negotiation with {0} timed out")]
    NegotiationTimeout(EndpointId),
    #[error("negotiation peer closed")]
    Closed,
    #[error("a negotiation is already in flight")]
    Busy,
    #[error("cannot start a negotiation in phase {0:?}")]
    NotStable(SignalingPhase),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("signal codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type NegotiationResult<T> = Result<T, NegotiationError>;
