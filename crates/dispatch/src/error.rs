use thiserror::Error;

use crate::envelope::EndpointId;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher closed")]
    Closed,
    #[error("endpoint {0} is not registered")]
    NotFound(EndpointId),
    #[error("relay rejected envelope: {0}")]
    Forbidden(String),
    #[error("no handler for envelope type {0:?}")]
    UnknownType(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("timed out waiting for the transport")]
    Timeout,
}

impl DispatchError {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchError::Closed => "closed",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::Forbidden(_) => "forbidden",
            DispatchError::UnknownType(_) => "unknown_type",
            DispatchError::Setup(_) => "setup",
            DispatchError::Transport(_) => "transport",
            DispatchError::Codec(_) => "codec",
            DispatchError::Timeout => "timeout",
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
