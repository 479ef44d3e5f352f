use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use beach_dispatch::EndpointId;
use serde::Serialize;
use thiserror::Error;

/// Registry-level failures, independent of the transport that hit them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("endpoint {0} is not registered")]
    NotFound(EndpointId),
    #[error("message type {0:?} cannot be routed")]
    InvalidKind(String),
    #[error("relay is draining")]
    Draining,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("endpoint {0} is not registered")]
    NotFound(EndpointId),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("push to {0} was not taken in time")]
    Timeout(EndpointId),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ApiError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NotFound(id) => ApiError::NotFound(id),
            RelayError::InvalidKind(_) => ApiError::BadRequest(err.to_string()),
            RelayError::Draining => ApiError::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status();
        let body = ApiErrorBody {
            error,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_errors_map_to_statuses() {
        let not_found = ApiError::from(RelayError::NotFound("ghost".into()));
        assert_eq!(not_found.status().0, StatusCode::NOT_FOUND);
        let bad = ApiError::from(RelayError::InvalidKind("a\nb".into()));
        assert_eq!(bad.status(), (StatusCode::BAD_REQUEST, "bad_request"));
        let draining = ApiError::from(RelayError::Draining);
        assert_eq!(draining.status().0, StatusCode::SERVICE_UNAVAILABLE);
    }
}
